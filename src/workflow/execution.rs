use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::definition::Workflow;
use super::step::{Step, StepStatus};
use crate::error::{FerrymanError, Result};
use crate::events::Event;
use crate::resilience::AttemptRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Forward-only: pending → running → {completed, failed, cancelled}.
    /// A running execution may pause and resume.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Per-step timing and retry accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub step_duration_ms: BTreeMap<String, u64>,
    pub step_retries: BTreeMap<String, u32>,
    pub step_attempts: BTreeMap<String, Vec<AttemptRecord>>,
}

impl ExecutionMetrics {
    pub fn total_retries(&self) -> u32 {
        self.step_retries.values().sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow: Workflow,
    pub status: ExecutionStatus,
    pub steps: Vec<Step>,
    pub current_step: usize,
    /// 0.0 to 1.0, never decreasing.
    pub progress: f64,
    pub results: Map<String, Value>,
    /// Append-only.
    pub events: Vec<Event>,
    pub metrics: ExecutionMetrics,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub type SharedExecution = Arc<RwLock<WorkflowExecution>>;

impl WorkflowExecution {
    pub fn new(workflow: Workflow, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: workflow.name.clone(),
            workflow,
            status: ExecutionStatus::Pending,
            steps,
            current_step: 0,
            progress: 0.0,
            results: Map::new(),
            events: Vec::new(),
            metrics: ExecutionMetrics::default(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FerrymanError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Raises progress to `value`; lower values are ignored.
    pub fn advance_progress(&mut self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        if value > self.progress {
            self.progress = value;
        }
    }

    pub fn record_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn running_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::build_plan;

    fn execution() -> WorkflowExecution {
        let workflow = Workflow::new("nightly", "/data", "s3://bucket");
        let steps = build_plan(&workflow).unwrap();
        WorkflowExecution::new(workflow, steps)
    }

    #[test]
    fn status_only_moves_forward() {
        let mut exec = execution();
        exec.transition(ExecutionStatus::Running).unwrap();
        assert!(exec.started_at.is_some());
        exec.transition(ExecutionStatus::Completed).unwrap();
        assert!(exec.finished_at.is_some());

        assert!(exec.transition(ExecutionStatus::Running).is_err());
        assert!(exec.transition(ExecutionStatus::Pending).is_err());
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn pause_and_resume_keep_start_time() {
        let mut exec = execution();
        exec.transition(ExecutionStatus::Running).unwrap();
        let started = exec.started_at;
        exec.transition(ExecutionStatus::Paused).unwrap();
        exec.transition(ExecutionStatus::Running).unwrap();
        assert_eq!(exec.started_at, started);
        assert!(!exec.transition(ExecutionStatus::Pending).is_ok());
    }

    #[test]
    fn progress_never_decreases() {
        let mut exec = execution();
        exec.advance_progress(0.5);
        exec.advance_progress(0.25);
        assert_eq!(exec.progress, 0.5);
        exec.advance_progress(3.0);
        assert_eq!(exec.progress, 1.0);
    }
}

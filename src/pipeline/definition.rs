use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::job::{Job, JobStatus, JobType};
use crate::error::{FerrymanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }

    /// Pending → Running → {Completed, Failed, Cancelled}; a pending
    /// pipeline may also fail validation or be cancelled before it starts.
    pub fn can_transition_to(self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Fixed-delay retry override; `None` keeps the category strategies.
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
    /// Per-attempt timeout of each job.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

fn default_max_concurrent_jobs() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            retry_attempts: None,
            retry_delay: None,
            timeout: None,
        }
    }
}

/// A set of jobs with dependency edges, run by the [`Scheduler`](super::Scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub jobs: Vec<Job>,
    pub status: PipelineStatus,
    pub config: PipelineConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub type SharedPipeline = Arc<RwLock<Pipeline>>;

impl Pipeline {
    pub fn new(name: impl Into<String>, config: PipelineConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            jobs: Vec::new(),
            status: PipelineStatus::Pending,
            config,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn with_jobs(mut self, jobs: impl IntoIterator<Item = Job>) -> Self {
        self.jobs.extend(jobs);
        self
    }

    /// Adds a job. Only allowed before the pipeline starts.
    pub fn add_job(&mut self, job: Job) -> Result<()> {
        if self.status != PipelineStatus::Pending {
            return Err(FerrymanError::InvalidTransition {
                from: self.status.to_string(),
                to: "add job".into(),
            });
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub(crate) fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn transition(&mut self, next: PipelineStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FerrymanError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            PipelineStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn definition(&self) -> PipelineDefinition {
        PipelineDefinition {
            id: self.id.clone(),
            name: self.name.clone(),
            config: self.config.clone(),
            created_at: self.created_at,
            jobs: self
                .jobs
                .iter()
                .map(|j| JobDefinition {
                    id: j.id.clone(),
                    name: j.name.clone(),
                    job_type: j.job_type,
                    depends_on: j.depends_on.clone(),
                    config: j.config.clone(),
                })
                .collect(),
        }
    }

    /// A fresh, pending pipeline built from a stored definition.
    pub fn from_definition(definition: PipelineDefinition) -> Self {
        let jobs = definition.jobs.into_iter().map(|d| {
            let mut job = Job::new(d.name, d.job_type).with_id(d.id);
            job.depends_on = d.depends_on;
            job.config = d.config;
            job
        });
        Self {
            id: definition.id,
            name: definition.name,
            created_at: definition.created_at,
            ..Self::new("", definition.config)
        }
        .with_jobs(jobs)
    }
}

/// The persisted shape of a pipeline: what to run, never how far it got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    pub config: PipelineConfig,
    pub created_at: DateTime<Utc>,
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub job_type: JobType,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        let mut pipeline = Pipeline::new("nightly", PipelineConfig::default());
        pipeline.transition(PipelineStatus::Running).unwrap();
        assert!(pipeline.started_at.is_some());
        pipeline.transition(PipelineStatus::Completed).unwrap();
        assert!(pipeline.finished_at.is_some());

        assert!(pipeline.transition(PipelineStatus::Running).is_err());
        assert!(pipeline.transition(PipelineStatus::Failed).is_err());
        assert_eq!(pipeline.status, PipelineStatus::Completed);
    }

    #[test]
    fn jobs_cannot_be_added_once_running() {
        let mut pipeline = Pipeline::new("nightly", PipelineConfig::default());
        pipeline.add_job(Job::new("a", JobType::Download)).unwrap();
        pipeline.transition(PipelineStatus::Running).unwrap();
        assert!(pipeline.add_job(Job::new("b", JobType::Upload)).is_err());
    }

    #[test]
    fn definition_drops_runtime_state() {
        let mut pipeline = Pipeline::new("nightly", PipelineConfig::default()).with_jobs([
            Job::new("fetch", JobType::Download).with_id("fetch"),
            Job::new("push", JobType::Upload).with_id("push").depends_on("fetch"),
        ]);
        pipeline.transition(PipelineStatus::Running).unwrap();
        pipeline.jobs[0].mark_running();

        let restored = Pipeline::from_definition(pipeline.definition());
        assert_eq!(restored.id, pipeline.id);
        assert_eq!(restored.status, PipelineStatus::Pending);
        assert_eq!(restored.jobs.len(), 2);
        assert!(restored.jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert!(restored.job("push").unwrap().depends_on.contains("fetch"));
    }

    #[test]
    fn config_parses_humantime() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"max_concurrent_jobs": 2, "retry_attempts": 3, "retry_delay": "500ms", "timeout": "10m"}"#,
        )
        .unwrap();
        assert_eq!(config.retry_delay, Some(Duration::from_millis(500)));
        assert_eq!(config.timeout, Some(Duration::from_secs(600)));
    }
}

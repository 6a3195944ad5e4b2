use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::definition::{StepDefinition, Workflow};
use crate::error::{FerrymanError, Result};
use crate::pipeline::DependencyGraph;

pub const ANALYZE_STEP: &str = "analyze";
pub const TRANSFER_STEP: &str = "transfer";
pub const REPORT_STEP: &str = "report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Analyze,
    Bundle,
    Transfer,
    Validate,
    Cleanup,
    Report,
}

impl StepKind {
    pub const ALL: [StepKind; 6] = [
        StepKind::Analyze,
        StepKind::Bundle,
        StepKind::Transfer,
        StepKind::Validate,
        StepKind::Cleanup,
        StepKind::Report,
    ];
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::Analyze => "analyze",
            StepKind::Bundle => "bundle",
            StepKind::Transfer => "transfer",
            StepKind::Validate => "validate",
            StepKind::Cleanup => "cleanup",
            StepKind::Report => "report",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One entry of an execution's step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub engine: Option<String>,
    pub config: Map<String, Value>,
    pub depends_on: Vec<String>,
    pub continue_on_failure: bool,
    pub status: StepStatus,
    pub retry_count: u32,
    pub output: Map<String, Value>,
    pub error: Option<String>,
    /// 0 to 100.
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            engine: None,
            config: Map::new(),
            depends_on: Vec::new(),
            continue_on_failure: false,
            status: StepStatus::Pending,
            retry_count: 0,
            output: Map::new(),
            error: None,
            progress: 0,
            started_at: None,
            finished_at: None,
        }
    }

    fn from_definition(definition: &StepDefinition, continue_on_failure: bool) -> Self {
        Self {
            engine: definition.engine.clone(),
            config: definition.config.clone(),
            depends_on: definition.depends_on.clone(),
            continue_on_failure,
            ..Self::new(definition.name.clone(), definition.kind)
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, output: Map<String, Value>, retries: u32) {
        self.status = StepStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.retry_count = retries;
        self.output = output;
        self.progress = 100;
        self.error = None;
    }

    pub(crate) fn mark_skipped(&mut self, reason: String, output: Map<String, Value>, retries: u32) {
        self.status = StepStatus::Skipped;
        self.finished_at = Some(Utc::now());
        self.retry_count = retries;
        self.output = output;
        self.progress = 100;
        self.error = Some(reason);
    }

    pub(crate) fn mark_failed(&mut self, error: String, retries: u32) {
        self.status = StepStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.retry_count = retries;
        self.error = Some(error);
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Builds `[analyze, ...preprocessing, transfer, ...postprocessing, report]`.
///
/// Steps inside each phase are ordered by `depends_on`, otherwise keeping
/// their declared order. A dependency may name a step of the same phase or
/// any step placed earlier in the plan.
pub fn build_plan(workflow: &Workflow) -> Result<Vec<Step>> {
    workflow.validate()?;

    let mut plan = vec![Step::new(ANALYZE_STEP, StepKind::Analyze)];
    order_phase(&workflow.preprocessing, false, &mut plan)?;
    plan.push(Step {
        engine: Some(workflow.engine.clone()),
        config: workflow.transfer.clone(),
        ..Step::new(TRANSFER_STEP, StepKind::Transfer)
    });
    order_phase(&workflow.postprocessing, true, &mut plan)?;
    plan.push(Step::new(REPORT_STEP, StepKind::Report));

    let mut names = HashSet::new();
    for step in &plan {
        if !names.insert(step.name.as_str()) {
            return Err(FerrymanError::Config(format!(
                "duplicate step name '{}' in workflow '{}'",
                step.name, workflow.name
            )));
        }
    }
    Ok(plan)
}

/// Stable topological ordering of one phase, appended to `plan`.
fn order_phase(steps: &[StepDefinition], post: bool, plan: &mut Vec<Step>) -> Result<()> {
    let in_phase: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    let earlier: HashSet<String> = plan.iter().map(|s| s.name.clone()).collect();

    for step in steps {
        for dep in &step.depends_on {
            if !in_phase.contains(dep.as_str()) && !earlier.contains(dep) {
                return Err(FerrymanError::DependencyUnsatisfied {
                    kind: "step",
                    name: dep.clone(),
                });
            }
        }
    }

    let graph = DependencyGraph::from_nodes(steps.iter().map(|step| {
        let local: BTreeSet<String> = step
            .depends_on
            .iter()
            .filter(|dep| in_phase.contains(dep.as_str()))
            .cloned()
            .collect();
        (step.name.clone(), local)
    }))?;
    for name in graph.topological_order()? {
        if let Some(step) = steps.iter().find(|step| step.name == name) {
            plan.push(Step::from_definition(step, post && step.continue_on_failure));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(plan: &[Step]) -> Vec<&str> {
        plan.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn minimal_plan_is_analyze_transfer_report() {
        let plan = build_plan(&Workflow::new("w", "/data", "s3://b")).unwrap();
        assert_eq!(names(&plan), ["analyze", "transfer", "report"]);
        assert_eq!(plan[1].engine.as_deref(), Some("auto"));
        assert!(plan.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn phases_surround_transfer() {
        let workflow = Workflow::new("w", "/data", "s3://b")
            .with_engine("rclone")
            .with_preprocessing(StepDefinition::new("bundle", StepKind::Bundle))
            .with_postprocessing(StepDefinition::new("verify", StepKind::Validate))
            .with_postprocessing(StepDefinition::new("tidy", StepKind::Cleanup).continue_on_failure());
        let plan = build_plan(&workflow).unwrap();
        assert_eq!(names(&plan), ["analyze", "bundle", "transfer", "verify", "tidy", "report"]);
        assert_eq!(plan[2].engine.as_deref(), Some("rclone"));
        assert!(plan[4].continue_on_failure);
    }

    #[test]
    fn depends_on_reorders_within_phase() {
        let workflow = Workflow::new("w", "/data", "s3://b")
            .with_postprocessing(StepDefinition::new("tidy", StepKind::Cleanup).after("verify"))
            .with_postprocessing(StepDefinition::new("verify", StepKind::Validate).after("transfer"));
        let plan = build_plan(&workflow).unwrap();
        assert_eq!(names(&plan), ["analyze", "transfer", "verify", "tidy", "report"]);
    }

    #[test]
    fn phase_cycle_is_detected() {
        let workflow = Workflow::new("w", "/data", "s3://b")
            .with_preprocessing(StepDefinition::new("a", StepKind::Bundle).after("b"))
            .with_preprocessing(StepDefinition::new("b", StepKind::Validate).after("a"));
        match build_plan(&workflow) {
            Err(FerrymanError::CycleDetected { jobs }) => assert_eq!(jobs, ["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn dependency_on_later_phase_is_unsatisfied() {
        let workflow = Workflow::new("w", "/data", "s3://b")
            .with_preprocessing(StepDefinition::new("bundle", StepKind::Bundle).after("verify"))
            .with_postprocessing(StepDefinition::new("verify", StepKind::Validate));
        assert!(matches!(
            build_plan(&workflow),
            Err(FerrymanError::DependencyUnsatisfied { kind: "step", .. })
        ));
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let workflow = Workflow::new("w", "/data", "s3://b")
            .with_postprocessing(StepDefinition::new("report", StepKind::Validate));
        assert!(matches!(build_plan(&workflow), Err(FerrymanError::Config(_))));
    }
}

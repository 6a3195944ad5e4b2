//! Declarative project files and their resolution into runnable workflows.
//!
//! A project names its sources, destinations and engine profiles once and
//! lets each workflow refer to them by name:
//!
//! ```toml
//! name = "genomics-archive"
//!
//! [sources.run42]
//! path = "/data/run-42"
//!
//! [destinations.archive]
//! uri = "s3://lab-archive/run-42"
//! storage_class = "DEEP_ARCHIVE"
//!
//! [[workflows]]
//! name = "nightly"
//! source = "run42"
//! destination = "archive"
//! timeout = "2h"
//!
//! [[workflows.preprocessing]]
//! name = "bundle"
//! kind = "bundle"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::step::StepKind;
use crate::error::{FerrymanError, Result};

/// Engine name that defers the choice to the analysis recommendations.
pub const AUTO_ENGINE: &str = "auto";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub path: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationDefinition {
    pub uri: String,
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Engine choice plus options handed to every transfer made under it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDefinition {
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Names of steps in the same phase that must run first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Only honoured on postprocessing steps.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            engine: None,
            config: Map::new(),
            depends_on: Vec::new(),
            continue_on_failure: false,
        }
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Fixed retry budget that replaces the per-category strategies for one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub attempts: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub delay: Duration,
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub profile: Option<String>,
    /// Overrides the profile's engine; `auto` when neither is set.
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub preprocessing: Vec<StepDefinition>,
    /// Config of the main transfer step.
    #[serde(default)]
    pub transfer: Map<String, Value>,
    #[serde(default)]
    pub postprocessing: Vec<StepDefinition>,
    /// Execution deadline such as `"45m"` or `"2h"`.
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

/// A workflow with every name reference resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    pub source: PathBuf,
    pub destination: String,
    pub storage_class: Option<String>,
    pub engine: String,
    pub preprocessing: Vec<StepDefinition>,
    pub transfer: Map<String, Value>,
    pub postprocessing: Vec<StepDefinition>,
    pub timeout: Option<String>,
    pub retry: Option<RetrySettings>,
}

impl Workflow {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            source: source.into(),
            destination: destination.into(),
            storage_class: None,
            engine: AUTO_ENGINE.to_string(),
            preprocessing: Vec::new(),
            transfer: Map::new(),
            postprocessing: Vec::new(),
            timeout: None,
            retry: None,
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_preprocessing(mut self, step: StepDefinition) -> Self {
        self.preprocessing.push(step);
        self
    }

    pub fn with_postprocessing(mut self, step: StepDefinition) -> Self {
        self.postprocessing.push(step);
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry = Some(RetrySettings { attempts, delay });
        self
    }

    /// Parses the timeout override, if any.
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout
            .as_deref()
            .map(|raw| {
                humantime_serde::re::humantime::parse_duration(raw.trim())
                    .map_err(|_| FerrymanError::InvalidTimeout(raw.to_string()))
            })
            .transpose()
    }

    /// Checks the phase-level rules that don't need the step plan.
    pub fn validate(&self) -> Result<()> {
        if let Some(step) = self.preprocessing.iter().find(|s| s.continue_on_failure) {
            return Err(FerrymanError::Config(format!(
                "step '{}': continue_on_failure is only allowed on postprocessing steps",
                step.name
            )));
        }
        self.timeout()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub name: String,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceDefinition>,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationDefinition>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileDefinition>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

impl ProjectDefinition {
    /// Loads a project file; `.json` files are read as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(toml::from_str(&contents)?)
        }
    }

    /// Resolves the workflow called `name`.
    pub fn workflow(&self, name: &str) -> Result<Workflow> {
        let definition = self
            .workflows
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| FerrymanError::DependencyUnsatisfied {
                kind: "workflow",
                name: name.to_string(),
            })?;
        self.resolve(definition)
    }

    /// Resolves every workflow, failing on the first bad reference.
    pub fn resolve_all(&self) -> Result<Vec<Workflow>> {
        let mut seen = HashSet::new();
        self.workflows
            .iter()
            .map(|definition| {
                if !seen.insert(definition.name.as_str()) {
                    return Err(FerrymanError::Config(format!(
                        "duplicate workflow name '{}'",
                        definition.name
                    )));
                }
                self.resolve(definition)
            })
            .collect()
    }

    fn resolve(&self, definition: &WorkflowDefinition) -> Result<Workflow> {
        let source = self.sources.get(&definition.source).ok_or_else(|| {
            FerrymanError::DependencyUnsatisfied {
                kind: "source",
                name: definition.source.clone(),
            }
        })?;
        let destination = self.destinations.get(&definition.destination).ok_or_else(|| {
            FerrymanError::DependencyUnsatisfied {
                kind: "destination",
                name: definition.destination.clone(),
            }
        })?;
        let profile = match &definition.profile {
            Some(name) => Some(self.profiles.get(name).ok_or_else(|| {
                FerrymanError::DependencyUnsatisfied {
                    kind: "profile",
                    name: name.clone(),
                }
            })?),
            None => None,
        };

        let engine = definition
            .engine
            .clone()
            .or_else(|| profile.and_then(|p| p.engine.clone()))
            .unwrap_or_else(|| AUTO_ENGINE.to_string());

        // profile options first, so the workflow's own transfer config wins
        let mut transfer = profile.map(|p| p.options.clone()).unwrap_or_default();
        transfer.extend(definition.transfer.clone());

        let workflow = Workflow {
            name: definition.name.clone(),
            description: definition.description.clone(),
            source: source.path.clone(),
            destination: destination.uri.clone(),
            storage_class: destination.storage_class.clone(),
            engine,
            preprocessing: definition.preprocessing.clone(),
            transfer,
            postprocessing: definition.postprocessing.clone(),
            timeout: definition.timeout.clone(),
            retry: definition.retry,
        };
        workflow.validate()?;
        Ok(workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
name = "genomics-archive"

[sources.run42]
path = "/data/run-42"

[destinations.archive]
uri = "s3://lab-archive/run-42"
storage_class = "DEEP_ARCHIVE"

[profiles.fast]
engine = "s5cmd"
options = { concurrency = 64 }

[[workflows]]
name = "nightly"
source = "run42"
destination = "archive"
profile = "fast"
timeout = "2h"
transfer = { checksum = true }
retry = { attempts = 2, delay = "30s" }

[[workflows.preprocessing]]
name = "bundle"
kind = "bundle"

[[workflows.postprocessing]]
name = "verify"
kind = "validate"

[[workflows.postprocessing]]
name = "tidy"
kind = "cleanup"
depends_on = ["verify"]
continue_on_failure = true
"#;

    #[test]
    fn resolves_named_references() {
        let project: ProjectDefinition = toml::from_str(PROJECT).unwrap();
        let workflow = project.workflow("nightly").unwrap();

        assert_eq!(workflow.source, PathBuf::from("/data/run-42"));
        assert_eq!(workflow.destination, "s3://lab-archive/run-42");
        assert_eq!(workflow.storage_class.as_deref(), Some("DEEP_ARCHIVE"));
        assert_eq!(workflow.engine, "s5cmd");
        assert_eq!(workflow.transfer["concurrency"], 64);
        assert_eq!(workflow.transfer["checksum"], true);
        assert_eq!(workflow.timeout().unwrap(), Some(Duration::from_secs(7200)));
        assert_eq!(
            workflow.retry,
            Some(RetrySettings {
                attempts: 2,
                delay: Duration::from_secs(30)
            })
        );
        assert_eq!(workflow.postprocessing[1].depends_on, vec!["verify"]);
    }

    #[test]
    fn missing_destination_is_unsatisfied() {
        let mut project: ProjectDefinition = toml::from_str(PROJECT).unwrap();
        project.workflows[0].destination = "glacier".into();
        match project.workflow("nightly") {
            Err(FerrymanError::DependencyUnsatisfied { kind, name }) => {
                assert_eq!(kind, "destination");
                assert_eq!(name, "glacier");
            }
            other => panic!("expected unsatisfied destination, got {other:?}"),
        }
    }

    #[test]
    fn missing_profile_and_workflow_are_unsatisfied() {
        let mut project: ProjectDefinition = toml::from_str(PROJECT).unwrap();
        assert!(matches!(
            project.workflow("weekly"),
            Err(FerrymanError::DependencyUnsatisfied { kind: "workflow", .. })
        ));
        project.workflows[0].profile = Some("slow".into());
        assert!(matches!(
            project.resolve_all(),
            Err(FerrymanError::DependencyUnsatisfied { kind: "profile", .. })
        ));
    }

    #[test]
    fn engine_defaults_to_auto() {
        let mut project: ProjectDefinition = toml::from_str(PROJECT).unwrap();
        project.workflows[0].profile = None;
        assert_eq!(project.workflow("nightly").unwrap().engine, AUTO_ENGINE);
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let workflow = Workflow::new("w", "/data", "s3://b").with_timeout("soon");
        assert!(matches!(
            workflow.timeout(),
            Err(FerrymanError::InvalidTimeout(raw)) if raw == "soon"
        ));
    }

    #[test]
    fn continue_on_failure_is_postprocessing_only() {
        let workflow = Workflow::new("w", "/data", "s3://b")
            .with_preprocessing(StepDefinition::new("bundle", StepKind::Bundle).continue_on_failure());
        assert!(matches!(workflow.validate(), Err(FerrymanError::Config(_))));
    }

    #[test]
    fn loads_json_projects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        let project: ProjectDefinition = toml::from_str(PROJECT).unwrap();
        std::fs::write(&path, serde_json::to_string(&project).unwrap()).unwrap();

        let loaded = ProjectDefinition::load(&path).unwrap();
        assert_eq!(loaded.workflows.len(), 1);
        assert_eq!(loaded.resolve_all().unwrap()[0].name, "nightly");
    }
}

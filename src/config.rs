//! Orchestrator configuration loaded from `ferryman.toml`.
//!
//! [`OrchestratorConfig`] holds every tunable of the core. Keys missing from
//! the file fall back to defaults. The `FERRYMAN_STATE_DIR` and
//! `FERRYMAN_MAX_WORKFLOWS` environment variables take precedence over the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FerrymanError, Result};
use crate::resilience::CircuitBreakerConfig;

pub const CONFIG_FILE: &str = "ferryman.toml";

/// Top-level configuration of an [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Ceiling on simultaneously active workflow executions.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Default worker pool size for pipelines that don't set their own.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Per-attempt timeout applied to pipeline jobs.
    #[serde(default = "default_job_timeout", with = "humantime_serde")]
    pub job_timeout: Duration,

    /// Deadline attached to every execution unless the workflow overrides it.
    #[serde(default, with = "humantime_serde")]
    pub workflow_timeout: Option<Duration>,

    /// Number of terminated executions kept for status queries.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Queue capacity of each event bus subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Root directory for persisted pipeline definitions.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Engine used when a workflow asks for `auto` and nothing is recommended.
    #[serde(default = "default_engine")]
    pub default_engine: String,

    /// Breaker settings used when a breaker is created for a new operation.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

fn default_max_concurrent_workflows() -> usize {
    4
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_history_limit() -> usize {
    100
}

fn default_event_buffer() -> usize {
    256
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".ferryman")
}

fn default_engine() -> String {
    "s5cmd".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_timeout: default_job_timeout(),
            workflow_timeout: None,
            history_limit: default_history_limit(),
            event_buffer: default_event_buffer(),
            state_dir: default_state_dir(),
            default_engine: default_engine(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads `ferryman.toml` from the current directory, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Loads configuration from an explicit path, or defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<OrchestratorConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(dir) = std::env::var("FERRYMAN_STATE_DIR")
            && !dir.is_empty()
        {
            config.state_dir = PathBuf::from(dir);
        }

        if let Ok(raw) = std::env::var("FERRYMAN_MAX_WORKFLOWS")
            && !raw.is_empty()
        {
            config.max_concurrent_workflows = raw.parse().map_err(|_| {
                FerrymanError::Config(format!("FERRYMAN_MAX_WORKFLOWS is not a number: {raw}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_workflows == 0 {
            return Err(FerrymanError::Config(
                "max_concurrent_workflows must be at least 1".into(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(FerrymanError::Config(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(FerrymanError::Config("event_buffer must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_workflows, 4);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert!(config.workflow_timeout.is_none());
        assert_eq!(config.default_engine, "s5cmd");
        assert_eq!(config.circuit_breaker.error_threshold, 5);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            max_concurrent_workflows = 2
            workflow_timeout = "90m"

            [circuit_breaker]
            error_threshold = 3
            recovery_timeout = "2m"
        "#;
        let config: OrchestratorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_workflows, 2);
        assert_eq!(config.workflow_timeout, Some(Duration::from_secs(90 * 60)));
        assert_eq!(config.circuit_breaker.error_threshold, 3);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(120));
        assert_eq!(config.circuit_breaker.half_open_max_calls, 3);
        assert_eq!(config.max_concurrent_jobs, 4);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "max_concurrent_jobs = 8\ndefault_engine = \"rclone\"\n").unwrap();

        let config = OrchestratorConfig::load_from(&path).unwrap();
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.default_engine, "rclone");
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.history_limit, 100);
    }

    #[test]
    fn zero_job_pool_is_rejected() {
        let config = OrchestratorConfig {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FerrymanError::Config(_))));
    }
}

use thiserror::Error;

/// Errors raised by the orchestration core itself.
///
/// Failures coming out of collaborators (analysis, bundling, transfer engines)
/// travel as `anyhow::Error` and are classified by the resilience layer; this
/// enum covers the conditions the orchestrator decides on its own.
#[derive(Debug, Error)]
pub enum FerrymanError {
    #[error("Concurrency limit exceeded: {limit} workflows already active")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("Unknown {kind} '{name}' referenced by the definition")]
    DependencyUnsatisfied { kind: &'static str, name: String },

    #[error("Step '{step}' failed after {attempts} attempt(s): {source}")]
    StepFailure {
        step: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Circuit breaker is open for {operation}")]
    CircuitOpen { operation: String },

    #[error("Dependency cycle detected between: {}", jobs.join(", "))]
    CycleDetected { jobs: Vec<String> },

    #[error("Pipeline '{pipeline}' ended {status}: {}", errors.join("; "))]
    PipelineFailed {
        pipeline: String,
        status: String,
        errors: Vec<String>,
    },

    #[error("Job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Transfer engine not registered: {0}")]
    EngineNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid timeout '{0}'")]
    InvalidTimeout(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FerrymanError {
    /// `false` when another attempt cannot help: the definition is broken,
    /// the caller cancelled, or the failed work already spent its own retries.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::PipelineFailed { .. }
                | Self::CycleDetected { .. }
                | Self::UnknownDependency { .. }
                | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, FerrymanError>;

//! Linear workflows: `analyze → preprocessing → transfer → postprocessing → report`.

mod definition;
mod engine;
mod execution;
mod handlers;
mod step;

pub use definition::{
    AUTO_ENGINE, DestinationDefinition, ProfileDefinition, ProjectDefinition, RetrySettings,
    SourceDefinition, StepDefinition, Workflow, WorkflowDefinition,
};
pub use engine::{ProgressCallback, ProgressCallbacks, ProgressUpdate, WorkflowEngine};
pub use execution::{ExecutionMetrics, ExecutionStatus, SharedExecution, WorkflowExecution};
pub use handlers::{StepContext, StepHandler, StepHandlers, StepOutcome, keys};
pub use step::{
    ANALYZE_STEP, REPORT_STEP, Step, StepKind, StepStatus, TRANSFER_STEP, build_plan,
};

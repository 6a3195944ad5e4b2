//! Orchestration core for moving research datasets to cloud object storage.
//!
//! Two execution models share one resilience layer:
//!
//! * [`workflow`]: a linear `analyze → preprocessing → transfer →
//!   postprocessing → report` state machine per dataset, run by the
//!   [`WorkflowEngine`](workflow::WorkflowEngine).
//! * [`pipeline`]: a dependency graph of jobs run under a concurrency
//!   ceiling by the [`Scheduler`](pipeline::Scheduler).
//!
//! The [`Orchestrator`](orchestrator::Orchestrator) owns the registries and is
//! the entry point for both.

pub mod cancel;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod resilience;
pub mod sim;
pub mod ui;
pub mod workflow;

pub use config::OrchestratorConfig;
pub use error::{FerrymanError, Result};
pub use orchestrator::Orchestrator;

//! Dependency-aware job pipelines.
//!
//! A [`Pipeline`] is a set of [`Job`]s with `depends_on` edges. The
//! [`Scheduler`] runs it under a bounded worker pool, each job going through
//! the shared [`ResilienceExecutor`](crate::resilience::ResilienceExecutor).

mod definition;
mod graph;
mod handlers;
mod job;
mod scheduler;
mod store;

pub use definition::{
    JobDefinition, Pipeline, PipelineConfig, PipelineDefinition, PipelineStatus, SharedPipeline,
};
pub use graph::DependencyGraph;
pub use handlers::{JobHandler, JobHandlers};
pub use job::{Job, JobStatus, JobType};
pub use scheduler::Scheduler;
pub use store::PipelineStore;

//! Dependency-graph execution of a pipeline under a bounded worker pool.
//!
//! Jobs whose dependencies are all `completed` go on the ready queue. A
//! counting semaphore sized to `max_concurrent_jobs` gates how many run at
//! once; each finished job wakes the scheduler through the `JoinSet`, which
//! settles it and unlocks its dependents. A failed job never unlocks its
//! dependents; they end `skipped`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::definition::{PipelineStatus, SharedPipeline};
use super::graph::DependencyGraph;
use super::handlers::JobHandlers;
use super::job::{Job, JobStatus};
use crate::cancel::CancelHandle;
use crate::error::Result;
use crate::events::{Event, EventBus, EventKind, Severity};
use crate::resilience::{FailureKind, Recovered, RecoveryFailure, ResilienceExecutor};

/// Fallback delay when a pipeline overrides attempts but not the delay.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

type JobOutcome = (
    String,
    std::result::Result<Recovered<Value>, RecoveryFailure>,
    OwnedSemaphorePermit,
);

#[derive(Clone)]
pub struct Scheduler {
    handlers: JobHandlers,
    executor: ResilienceExecutor,
    bus: Arc<EventBus>,
    job_timeout: Option<Duration>,
}

impl Scheduler {
    pub fn new(handlers: JobHandlers, executor: ResilienceExecutor, bus: Arc<EventBus>) -> Self {
        Self {
            handlers,
            executor,
            bus,
            job_timeout: None,
        }
    }

    /// Timeout applied to each job attempt unless the pipeline sets its own.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn handlers(&self) -> &JobHandlers {
        &self.handlers
    }

    /// Runs every reachable job of `pipeline` and returns its final status.
    ///
    /// Fails fast, before any job starts, on unknown dependencies or cycles.
    pub async fn run(&self, pipeline: &SharedPipeline, cancel: &CancelHandle) -> Result<PipelineStatus> {
        let (pipeline_id, jobs, config) = {
            let p = pipeline.read().await;
            (p.id.clone(), p.jobs.clone(), p.config.clone())
        };

        let graph = match DependencyGraph::build(&jobs) {
            Ok(graph) => graph,
            Err(e) => {
                error!(pipeline = %pipeline_id, error = %e, "pipeline rejected");
                let mut p = pipeline.write().await;
                p.error = Some(e.to_string());
                p.transition(PipelineStatus::Failed)?;
                self.publish(Event::new(EventKind::PipelineFinished, &pipeline_id, e.to_string())
                    .with_severity(Severity::Error));
                return Err(e);
            }
        };

        pipeline.write().await.transition(PipelineStatus::Running)?;
        info!(pipeline = %pipeline_id, jobs = jobs.len(), max_concurrent = config.max_concurrent_jobs, "pipeline started");
        self.publish(Event::new(
            EventKind::PipelineStarted,
            &pipeline_id,
            format!("{} jobs", jobs.len()),
        ));

        let executor = Arc::new(match config.retry_attempts {
            Some(attempts) => self.executor.with_policy(
                self.executor
                    .policy()
                    .clone()
                    .with_fixed_limits(attempts, config.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY)),
            ),
            None => self.executor.clone(),
        });
        let timeout = config.timeout.or(self.job_timeout);

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        let mut remaining: HashMap<String, usize> = jobs
            .iter()
            .map(|j| (j.id.clone(), j.depends_on.len()))
            .collect();
        let mut ready: VecDeque<String> = graph.roots().into();
        let mut running: JoinSet<JobOutcome> = JoinSet::new();
        let mut task_jobs = HashMap::new();
        let mut failures = 0usize;
        let mut cancelled = false;

        loop {
            while let Some(id) = ready.pop_front() {
                if cancel.is_cancelled() {
                    cancelled = true;
                    ready.clear();
                    break;
                }
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    ready.push_front(id);
                    break;
                };
                let Some(job) = ({
                    let mut p = pipeline.write().await;
                    p.job_mut(&id).map(|job| {
                        job.mark_running();
                        job.clone()
                    })
                }) else {
                    continue;
                };
                self.publish(
                    Event::new(EventKind::JobStarted, &pipeline_id, format!("{} started", job.name))
                        .with_step(job.name.clone()),
                );
                let handle = self.spawn_job(&mut running, job, permit, &executor, timeout, cancel);
                task_jobs.insert(handle, id);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (id, outcome) = match joined {
                Ok((task_id, (id, outcome, permit))) => {
                    task_jobs.remove(&task_id);
                    drop(permit);
                    (id, outcome)
                }
                Err(join_error) => {
                    let Some(id) = task_jobs.remove(&join_error.id()) else {
                        continue;
                    };
                    failures += 1;
                    let message = format!("job task aborted: {join_error}");
                    self.settle_failure(pipeline, &pipeline_id, &id, message, 0).await;
                    continue;
                }
            };

            match outcome {
                Ok(recovered) => {
                    let retries = recovered.retries();
                    let name = {
                        let mut p = pipeline.write().await;
                        match p.job_mut(&id) {
                            Some(job) => {
                                job.mark_completed(recovered.value, retries);
                                job.name.clone()
                            }
                            None => id.clone(),
                        }
                    };
                    debug!(pipeline = %pipeline_id, job = %name, retries, "job completed");
                    self.publish(
                        Event::new(EventKind::JobCompleted, &pipeline_id, format!("{name} completed"))
                            .with_step(name)
                            .with_data(json!({ "retries": retries })),
                    );
                    for dependent in graph.dependents(&id) {
                        if let Some(count) = remaining.get_mut(&dependent) {
                            *count -= 1;
                            if *count == 0 {
                                ready.push_back(dependent);
                            }
                        }
                    }
                }
                Err(failure) if failure.kind == FailureKind::Cancelled => {
                    cancelled = true;
                    let reason = format!(
                        "pipeline cancelled during retry back-off: {}",
                        cancel.reason().unwrap_or("cancelled by request")
                    );
                    let name = {
                        let mut p = pipeline.write().await;
                        match p.job_mut(&id) {
                            Some(job) => {
                                job.retry_count = failure.attempts.saturating_sub(1);
                                job.mark_skipped(reason);
                                job.name.clone()
                            }
                            None => id.clone(),
                        }
                    };
                    info!(pipeline = %pipeline_id, job = %name, attempts = failure.attempts, "job abandoned on cancel");
                }
                Err(failure) => {
                    failures += 1;
                    let retries = failure.attempts.saturating_sub(1);
                    self.settle_failure(pipeline, &pipeline_id, &id, failure.to_string(), retries)
                        .await;
                }
            }
        }

        let status = {
            let mut p = pipeline.write().await;
            cancelled |= cancel.is_cancelled() && p.jobs.iter().any(|j| j.status == JobStatus::Pending);
            let completed: Vec<String> = p
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .map(|j| j.id.clone())
                .collect();
            for job in p.jobs.iter_mut().filter(|j| j.status == JobStatus::Pending) {
                let reason = if cancelled {
                    "pipeline cancelled before job started".to_string()
                } else {
                    let blockers: Vec<&str> = job
                        .depends_on
                        .iter()
                        .filter(|dep| !completed.contains(dep))
                        .map(String::as_str)
                        .collect();
                    format!("blocked by unfinished dependencies: {}", blockers.join(", "))
                };
                job.mark_skipped(reason);
            }

            let status = if cancelled {
                PipelineStatus::Cancelled
            } else if failures > 0 {
                PipelineStatus::Failed
            } else {
                PipelineStatus::Completed
            };
            if failures > 0 {
                p.error = Some(format!("{failures} jobs failed"));
            }
            p.transition(status)?;
            status
        };

        info!(pipeline = %pipeline_id, %status, failures, "pipeline finished");
        let severity = match status {
            PipelineStatus::Completed => Severity::Info,
            PipelineStatus::Cancelled => Severity::Warning,
            _ => Severity::Error,
        };
        self.publish(
            Event::new(EventKind::PipelineFinished, &pipeline_id, status.to_string())
                .with_severity(severity)
                .with_data(json!({ "failed_jobs": failures })),
        );
        Ok(status)
    }

    fn spawn_job(
        &self,
        running: &mut JoinSet<JobOutcome>,
        job: Job,
        permit: OwnedSemaphorePermit,
        executor: &Arc<ResilienceExecutor>,
        timeout: Option<Duration>,
        cancel: &CancelHandle,
    ) -> tokio::task::Id {
        let handler = self.handlers.get(job.job_type);
        let executor = Arc::clone(executor);
        let cancel = cancel.clone();
        let operation = match job.config_str("engine") {
            Some(engine) => format!("job:{}:{engine}", job.job_type),
            None => format!("job:{}", job.job_type),
        };

        running
            .spawn(async move {
                let job_ref = &job;
                let handler = handler.as_ref();
                let outcome = executor
                    .execute(&operation, &cancel, |_| async move {
                        let handler = handler.map_err(|e| anyhow!("{e}"))?;
                        let result: anyhow::Result<Value> = match timeout {
                            Some(limit) => tokio::time::timeout(limit, handler.run(job_ref))
                                .await
                                .map_err(|_| {
                                    anyhow!("job '{}' timed out after {limit:?}", job_ref.name)
                                })?,
                            None => handler.run(job_ref).await,
                        };
                        result
                    })
                    .await;
                (job.id.clone(), outcome, permit)
            })
            .id()
    }

    async fn settle_failure(
        &self,
        pipeline: &SharedPipeline,
        pipeline_id: &str,
        job_id: &str,
        message: String,
        retries: u32,
    ) {
        let name = {
            let mut p = pipeline.write().await;
            match p.job_mut(job_id) {
                Some(job) => {
                    job.mark_failed(message.clone(), retries);
                    job.name.clone()
                }
                None => job_id.to_string(),
            }
        };
        warn!(pipeline = %pipeline_id, job = %name, error = %message, "job failed");
        self.publish(
            Event::new(EventKind::JobFailed, pipeline_id, message)
                .with_step(name)
                .with_data(json!({ "retries": retries })),
        );
    }

    fn publish(&self, event: Event) {
        self.bus.publish(&event);
    }
}

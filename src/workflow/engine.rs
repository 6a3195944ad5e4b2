//! Sequential execution of a workflow's step plan.
//!
//! Steps run one at a time. Before each step the engine checks the
//! execution's [`CancelHandle`] and [`PauseGate`]; a step already running is
//! never interrupted.
//! Every step attempt goes through the shared [`ResilienceExecutor`].

use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::execution::{ExecutionStatus, SharedExecution};
use super::handlers::{StepContext, StepHandlers, StepOutcome};
use super::step::Step;
use crate::cancel::{CancelHandle, PauseGate};
use crate::collaborators::Collaborators;
use crate::error::{FerrymanError, Result};
use crate::events::{Event, EventBus, EventKind, Severity};
use crate::pipeline::Scheduler;
use crate::resilience::{
    FailureKind, RecoveryFailure, ResilienceExecutor, RetryNotice, RetryObserver,
};

/// Pushed to progress callbacks after every step.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub execution_id: Uuid,
    pub workflow: String,
    pub step: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub progress: f64,
    pub status: ExecutionStatus,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Externally registered progress listeners. Delivery is best-effort.
#[derive(Clone, Default)]
pub struct ProgressCallbacks {
    callbacks: Arc<StdRwLock<Vec<ProgressCallback>>>,
}

impl ProgressCallbacks {
    pub fn register(&self, callback: ProgressCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, update: &ProgressUpdate) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for callback in callbacks {
            callback(update);
        }
    }
}

#[derive(Clone)]
pub struct WorkflowEngine {
    handlers: StepHandlers,
    collaborators: Collaborators,
    executor: ResilienceExecutor,
    scheduler: Scheduler,
    bus: Arc<EventBus>,
    progress: ProgressCallbacks,
    default_engine: String,
    max_concurrent_jobs: usize,
}

impl WorkflowEngine {
    pub fn new(
        collaborators: Collaborators,
        executor: ResilienceExecutor,
        scheduler: Scheduler,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            handlers: StepHandlers::new(),
            collaborators,
            executor,
            scheduler,
            bus,
            progress: ProgressCallbacks::default(),
            default_engine: "s5cmd".to_string(),
            max_concurrent_jobs: 4,
        }
    }

    pub fn with_handlers(mut self, handlers: StepHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallbacks) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_default_engine(mut self, engine: impl Into<String>) -> Self {
        self.default_engine = engine.into();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn progress(&self) -> &ProgressCallbacks {
        &self.progress
    }

    /// Runs every step of `execution` and returns its terminal status.
    pub async fn run(
        &self,
        execution: &SharedExecution,
        cancel: &CancelHandle,
    ) -> Result<ExecutionStatus> {
        self.run_gated(execution, cancel, &PauseGate::new()).await
    }

    /// Like [`run`](Self::run), holding the execution `paused` at the next
    /// step boundary whenever `pause` is closed.
    pub async fn run_gated(
        &self,
        execution: &SharedExecution,
        cancel: &CancelHandle,
        pause: &PauseGate,
    ) -> Result<ExecutionStatus> {
        let (execution_id, workflow, total) = {
            let mut exec = execution.write().await;
            exec.transition(ExecutionStatus::Running)?;
            (exec.id, exec.workflow.clone(), exec.steps.len())
        };
        info!(%execution_id, workflow = %workflow.name, steps = total, "workflow started");
        self.emit(
            execution,
            Event::new(
                EventKind::WorkflowStarted,
                execution_id.to_string(),
                format!("workflow '{}' started", workflow.name),
            ),
        )
        .await;

        let executor = match workflow.retry {
            Some(retry) => self.executor.with_policy(
                self.executor
                    .policy()
                    .clone()
                    .with_fixed_limits(retry.attempts, retry.delay),
            ),
            None => self.executor.clone(),
        };

        for index in 0..total {
            if let Some(reason) = cancel.reason() {
                return self.finish_cancelled(execution, execution_id, reason).await;
            }
            if pause.is_paused() {
                self.hold(execution, execution_id, index, pause, cancel).await?;
                if let Some(reason) = cancel.reason() {
                    return self.finish_cancelled(execution, execution_id, reason).await;
                }
            }

            let (step, results, steps) = {
                let mut exec = execution.write().await;
                exec.current_step = index;
                exec.steps[index].mark_running();
                (exec.steps[index].clone(), exec.results.clone(), exec.steps.clone())
            };
            info!(%execution_id, step = %step.name, kind = %step.kind, "step started");
            self.emit(
                execution,
                Event::new(
                    EventKind::StepStarted,
                    execution_id.to_string(),
                    format!("step '{}' started", step.name),
                )
                .with_step(step.name.clone()),
            )
            .await;

            let ctx = StepContext {
                execution_id,
                workflow: &workflow,
                results: &results,
                steps: &steps,
                collaborators: &self.collaborators,
                scheduler: &self.scheduler,
                cancel,
                default_engine: &self.default_engine,
                max_concurrent_jobs: self.max_concurrent_jobs,
            };
            let observer = StepRetryEvents {
                engine: self,
                execution,
                execution_id,
                index,
                step: step.name.clone(),
            };
            let handler = self
                .handlers
                .get(step.kind)
                .map_err(|e| FerrymanError::Config(e.to_string()))?;
            let operation = format!("{}.{}", workflow.name, step.name);
            let outcome = executor
                .execute_observed(&operation, cancel, &observer, |_| {
                    handler.execute(&step, &ctx)
                })
                .await;

            match outcome {
                Ok(recovered) => {
                    let retries = recovered.retries();
                    let (event, duration) = {
                        let mut exec = execution.write().await;
                        let event = match recovered.value {
                            StepOutcome::Completed { output } => {
                                exec.results.extend(output.clone());
                                exec.steps[index].mark_completed(output, retries);
                                Event::new(
                                    EventKind::StepCompleted,
                                    execution_id.to_string(),
                                    format!("step '{}' completed", step.name),
                                )
                            }
                            StepOutcome::Skipped { reason, output } => {
                                exec.steps[index].mark_skipped(reason.clone(), output, retries);
                                Event::new(
                                    EventKind::StepSkipped,
                                    execution_id.to_string(),
                                    format!("step '{}' skipped: {reason}", step.name),
                                )
                            }
                        };
                        let duration = exec.steps[index].duration_ms().unwrap_or(0);
                        exec.metrics.step_duration_ms.insert(step.name.clone(), duration);
                        exec.metrics.step_retries.insert(step.name.clone(), retries);
                        exec.metrics
                            .step_attempts
                            .insert(step.name.clone(), recovered.attempts);
                        (event, duration)
                    };
                    info!(%execution_id, step = %step.name, retries, duration_ms = duration, "step finished");
                    self.emit(
                        execution,
                        event
                            .with_step(step.name.clone())
                            .with_data(json!({ "retries": retries, "duration_ms": duration })),
                    )
                    .await;
                }
                Err(failure) => {
                    let retries = failure.attempts.saturating_sub(1);
                    self.record_step_failure(execution, execution_id, index, &step, &failure, retries)
                        .await;

                    if failure.kind == FailureKind::Cancelled {
                        let reason = cancel.reason().unwrap_or("cancelled by request");
                        return self.finish_cancelled(execution, execution_id, reason).await;
                    }
                    if step.continue_on_failure {
                        warn!(%execution_id, step = %step.name, "step failed, continuing");
                    } else {
                        let error = FerrymanError::StepFailure {
                            step: step.name.clone(),
                            attempts: failure.attempts,
                            source: failure.message.into(),
                        };
                        return self.finish_failed(execution, execution_id, error).await;
                    }
                }
            }

            self.report_progress(execution, index, total).await;
        }

        let mut exec = execution.write().await;
        exec.transition(ExecutionStatus::Completed)?;
        exec.advance_progress(1.0);
        let event = Event::new(
            EventKind::WorkflowCompleted,
            execution_id.to_string(),
            format!("workflow '{}' completed", workflow.name),
        )
        .with_data(json!({ "retries": exec.metrics.total_retries() }));
        exec.record_event(event.clone());
        drop(exec);
        self.bus.publish(&event);
        info!(%execution_id, "workflow completed");
        Ok(ExecutionStatus::Completed)
    }

    async fn record_step_failure(
        &self,
        execution: &SharedExecution,
        execution_id: Uuid,
        index: usize,
        step: &Step,
        failure: &RecoveryFailure,
        retries: u32,
    ) {
        {
            let mut exec = execution.write().await;
            exec.steps[index].mark_failed(failure.message.clone(), retries);
            let duration = exec.steps[index].duration_ms().unwrap_or(0);
            exec.metrics.step_duration_ms.insert(step.name.clone(), duration);
            exec.metrics.step_retries.insert(step.name.clone(), retries);
            exec.metrics
                .step_attempts
                .insert(step.name.clone(), failure.attempt_log.clone());
            if !failure.suggestions.is_empty() {
                exec.results
                    .insert("suggestions".into(), json!(failure.suggestions));
            }
        }
        error!(
            %execution_id,
            step = %step.name,
            attempts = failure.attempts,
            category = ?failure.category,
            error = %failure.message,
            "step failed"
        );
        self.emit(
            execution,
            Event::new(
                EventKind::StepFailed,
                execution_id.to_string(),
                format!("step '{}' failed: {}", step.name, failure.message),
            )
            .with_step(step.name.clone())
            .with_data(json!({
                "attempts": failure.attempts,
                "kind": failure.kind,
                "category": failure.category,
                "actions": failure.actions,
                "suggestions": failure.suggestions,
            })),
        )
        .await;
    }

    /// Parks the execution in `paused` until resumed or cancelled.
    async fn hold(
        &self,
        execution: &SharedExecution,
        execution_id: Uuid,
        index: usize,
        pause: &PauseGate,
        cancel: &CancelHandle,
    ) -> Result<()> {
        let step = {
            let mut exec = execution.write().await;
            exec.transition(ExecutionStatus::Paused)?;
            exec.steps[index].name.clone()
        };
        info!(%execution_id, next_step = %step, "workflow paused");
        self.emit(
            execution,
            Event::new(
                EventKind::WorkflowPaused,
                execution_id.to_string(),
                format!("workflow paused before step '{step}'"),
            ),
        )
        .await;

        if !pause.wait_resumed(cancel).await {
            return Ok(());
        }
        execution.write().await.transition(ExecutionStatus::Running)?;
        info!(%execution_id, next_step = %step, "workflow resumed");
        self.emit(
            execution,
            Event::new(
                EventKind::WorkflowResumed,
                execution_id.to_string(),
                format!("workflow resumed at step '{step}'"),
            ),
        )
        .await;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        execution: &SharedExecution,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<ExecutionStatus> {
        {
            let mut exec = execution.write().await;
            exec.transition(ExecutionStatus::Cancelled)?;
            exec.error = Some(reason.to_string());
        }
        warn!(%execution_id, reason, "workflow cancelled");
        self.emit(
            execution,
            Event::new(
                EventKind::WorkflowCancelled,
                execution_id.to_string(),
                format!("workflow cancelled: {reason}"),
            ),
        )
        .await;
        Ok(ExecutionStatus::Cancelled)
    }

    async fn finish_failed(
        &self,
        execution: &SharedExecution,
        execution_id: Uuid,
        error: FerrymanError,
    ) -> Result<ExecutionStatus> {
        let message = error.to_string();
        {
            let mut exec = execution.write().await;
            exec.transition(ExecutionStatus::Failed)?;
            exec.error = Some(message.clone());
        }
        error!(%execution_id, error = %message, "workflow failed");
        self.emit(
            execution,
            Event::new(EventKind::WorkflowFailed, execution_id.to_string(), message),
        )
        .await;
        Ok(ExecutionStatus::Failed)
    }

    async fn report_progress(&self, execution: &SharedExecution, index: usize, total: usize) {
        let update = {
            let mut exec = execution.write().await;
            exec.advance_progress((index + 1) as f64 / total as f64);
            ProgressUpdate {
                execution_id: exec.id,
                workflow: exec.workflow_name.clone(),
                step: exec.steps[index].name.clone(),
                step_index: index,
                total_steps: total,
                progress: exec.progress,
                status: exec.status,
            }
        };
        self.progress.notify(&update);
    }

    /// Appends to the execution's log, then publishes on the bus.
    async fn emit(&self, execution: &SharedExecution, event: Event) {
        execution.write().await.record_event(event.clone());
        self.bus.publish(&event);
    }
}

/// Turns each retry decision into a `step.retry` event as it happens.
struct StepRetryEvents<'a> {
    engine: &'a WorkflowEngine,
    execution: &'a SharedExecution,
    execution_id: Uuid,
    index: usize,
    step: String,
}

#[async_trait]
impl RetryObserver for StepRetryEvents<'_> {
    async fn on_retry(&self, notice: &RetryNotice) {
        self.execution.write().await.steps[self.index].retry_count = notice.attempt;
        let event = Event::new(
            EventKind::StepRetry,
            self.execution_id.to_string(),
            format!(
                "step '{}' attempt {} failed ({}), retrying in {:?}",
                self.step, notice.attempt, notice.category, notice.delay
            ),
        )
        .with_step(self.step.clone())
        .with_severity(Severity::Warning)
        .with_data(json!({
            "attempt": notice.attempt,
            "category": notice.category,
            "delay_ms": notice.delay.as_millis() as u64,
            "error": notice.error,
        }));
        self.engine.emit(self.execution, event).await;
    }
}

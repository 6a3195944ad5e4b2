//! Top-level registries and lifecycle operations.
//!
//! An [`Orchestrator`] owns everything that would otherwise be process-wide
//! state: the active-execution registry, bounded history, pipelines, the
//! transfer-engine registry, circuit breakers and the event bus. Registries
//! sit behind reader/writer locks; queries take the read side, start,
//! registration and removal take the write side.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, PauseGate};
use crate::collaborators::{Collaborators, EngineRegistry, TransferEngine};
use crate::config::OrchestratorConfig;
use crate::error::{FerrymanError, Result};
use crate::events::{Event, EventBus};
use crate::pipeline::{
    DependencyGraph, Job, JobHandlers, Pipeline, PipelineConfig, PipelineStatus, PipelineStore,
    Scheduler, SharedPipeline,
};
use crate::resilience::{BreakerStatus, CircuitBreakers, ResilienceExecutor, RetryPolicy};
use crate::workflow::{
    ExecutionStatus, ProgressUpdate, ProjectDefinition, SharedExecution, StepHandlers, Workflow,
    WorkflowEngine, WorkflowExecution, build_plan,
};

struct ActiveExecution {
    state: SharedExecution,
    cancel: CancelHandle,
    pause: PauseGate,
    done: watch::Receiver<bool>,
}

struct RegisteredPipeline {
    state: SharedPipeline,
    cancel: CancelHandle,
}

/// Point-in-time view of an execution, cheap to list.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub current_step: Option<String>,
}

impl From<&WorkflowExecution> for ExecutionSummary {
    fn from(exec: &WorkflowExecution) -> Self {
        Self {
            id: exec.id,
            workflow: exec.workflow_name.clone(),
            status: exec.status,
            progress: exec.progress,
            current_step: exec.steps.get(exec.current_step).map(|s| s.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub id: String,
    pub name: String,
    pub status: PipelineStatus,
    pub jobs: usize,
}

impl From<&Pipeline> for PipelineSummary {
    fn from(pipeline: &Pipeline) -> Self {
        Self {
            id: pipeline.id.clone(),
            name: pipeline.name.clone(),
            status: pipeline.status,
            jobs: pipeline.jobs.len(),
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    executions: Arc<RwLock<HashMap<Uuid, ActiveExecution>>>,
    history: Arc<RwLock<VecDeque<WorkflowExecution>>>,
    pipelines: RwLock<HashMap<String, RegisteredPipeline>>,
    engines: Arc<EngineRegistry>,
    breakers: Arc<CircuitBreakers>,
    bus: Arc<EventBus>,
    scheduler: Scheduler,
    engine: Arc<WorkflowEngine>,
    store: PipelineStore,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let engines = Arc::clone(&collaborators.engines);
        let breakers = Arc::new(CircuitBreakers::new(config.circuit_breaker.clone()));
        let bus = Arc::new(EventBus::new(config.event_buffer));
        let executor = ResilienceExecutor::new(RetryPolicy::default(), Arc::clone(&breakers));
        let scheduler = Scheduler::new(
            JobHandlers::new(Arc::clone(&engines)),
            executor.clone(),
            Arc::clone(&bus),
        )
        .with_job_timeout(config.job_timeout);
        let engine = WorkflowEngine::new(collaborators, executor, scheduler.clone(), Arc::clone(&bus))
            .with_default_engine(config.default_engine.clone())
            .with_max_concurrent_jobs(config.max_concurrent_jobs);
        let store = PipelineStore::new(&config.state_dir);

        Self {
            config,
            executions: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            pipelines: RwLock::new(HashMap::new()),
            engines,
            breakers,
            bus,
            scheduler,
            engine: Arc::new(engine),
            store,
        }
    }

    /// Replaces the step handler table. Only affects executions started afterwards.
    pub fn with_step_handlers(mut self, handlers: StepHandlers) -> Self {
        self.engine = Arc::new((*self.engine).clone().with_handlers(handlers));
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // --- workflows ---

    /// Admits and spawns a new execution of `workflow`.
    ///
    /// Fails with [`FerrymanError::ConcurrencyLimitExceeded`] when
    /// `max_concurrent_workflows` executions are already active.
    pub async fn start_workflow(&self, workflow: Workflow) -> Result<Uuid> {
        let steps = build_plan(&workflow)?;
        let cancel = match workflow.timeout()?.or(self.config.workflow_timeout) {
            Some(timeout) => CancelHandle::with_timeout(timeout),
            None => CancelHandle::new(),
        };
        let execution = WorkflowExecution::new(workflow, steps);
        let id = execution.id;
        let workflow_name = execution.workflow_name.clone();
        let state: SharedExecution = Arc::new(RwLock::new(execution));
        let (done_tx, done_rx) = watch::channel(false);
        let pause = PauseGate::new();

        {
            let mut active = self.executions.write().await;
            if active.len() >= self.config.max_concurrent_workflows {
                warn!(workflow = %workflow_name, active = active.len(), "execution rejected at capacity");
                return Err(FerrymanError::ConcurrencyLimitExceeded {
                    limit: self.config.max_concurrent_workflows,
                });
            }
            active.insert(
                id,
                ActiveExecution {
                    state: Arc::clone(&state),
                    cancel: cancel.clone(),
                    pause: pause.clone(),
                    done: done_rx,
                },
            );
        }
        info!(execution_id = %id, workflow = %workflow_name, "execution admitted");

        let engine = Arc::clone(&self.engine);
        let executions = Arc::clone(&self.executions);
        let history = Arc::clone(&self.history);
        let history_limit = self.config.history_limit;
        tokio::spawn(async move {
            if let Err(e) = engine.run_gated(&state, &cancel, &pause).await {
                error!(execution_id = %id, error = %e, "execution aborted");
                let mut exec = state.write().await;
                exec.error = Some(e.to_string());
                if !exec.status.is_terminal() {
                    let _ = exec.transition(ExecutionStatus::Failed);
                }
            }

            let snapshot = state.read().await.clone();
            {
                let mut history = history.write().await;
                history.push_back(snapshot);
                while history.len() > history_limit {
                    history.pop_front();
                }
            }
            executions.write().await.remove(&id);
            let _ = done_tx.send(true);
        });

        Ok(id)
    }

    /// Resolves `name` from a project definition and starts it.
    pub async fn start_from_project(&self, project: &ProjectDefinition, name: &str) -> Result<Uuid> {
        let workflow = project.workflow(name)?;
        self.start_workflow(workflow).await
    }

    /// Requests cancellation. Takes effect before the execution's next step.
    pub async fn cancel_workflow(&self, id: Uuid) -> Result<()> {
        if let Some(active) = self.executions.read().await.get(&id) {
            info!(execution_id = %id, "cancellation requested");
            active.cancel.cancel();
            return Ok(());
        }
        if self.history.read().await.iter().any(|e| e.id == id) {
            return Ok(());
        }
        Err(FerrymanError::ExecutionNotFound(id.to_string()))
    }

    /// Requests a pause. The execution enters `paused` before its next step;
    /// a step already running finishes first.
    pub async fn pause_workflow(&self, id: Uuid) -> Result<()> {
        let active = self.executions.read().await;
        let active = active
            .get(&id)
            .ok_or_else(|| FerrymanError::ExecutionNotFound(id.to_string()))?;
        if active.pause.pause() {
            info!(execution_id = %id, "pause requested");
        }
        Ok(())
    }

    /// Lets a paused execution continue with its next step.
    pub async fn resume_workflow(&self, id: Uuid) -> Result<()> {
        let active = self.executions.read().await;
        let active = active
            .get(&id)
            .ok_or_else(|| FerrymanError::ExecutionNotFound(id.to_string()))?;
        if active.pause.resume() {
            info!(execution_id = %id, "resume requested");
        }
        Ok(())
    }

    /// Snapshot of a live or finished execution.
    pub async fn execution(&self, id: Uuid) -> Result<WorkflowExecution> {
        let state = self
            .executions
            .read()
            .await
            .get(&id)
            .map(|active| Arc::clone(&active.state));
        if let Some(state) = state {
            return Ok(state.read().await.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| FerrymanError::ExecutionNotFound(id.to_string()))
    }

    pub async fn status(&self, id: Uuid) -> Result<ExecutionStatus> {
        Ok(self.execution(id).await?.status)
    }

    /// Waits for an execution to terminate and returns its final state.
    pub async fn wait(&self, id: Uuid) -> Result<WorkflowExecution> {
        let done = self
            .executions
            .read()
            .await
            .get(&id)
            .map(|active| active.done.clone());
        if let Some(mut done) = done {
            // a closed channel means the task already finished
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.execution(id).await
    }

    pub async fn active_count(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn list_active(&self) -> Vec<ExecutionSummary> {
        let states: Vec<SharedExecution> = self
            .executions
            .read()
            .await
            .values()
            .map(|active| Arc::clone(&active.state))
            .collect();
        let mut summaries = Vec::with_capacity(states.len());
        for state in states {
            summaries.push(ExecutionSummary::from(&*state.read().await));
        }
        summaries.sort_by(|a, b| a.workflow.cmp(&b.workflow).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Terminated executions, oldest first.
    pub async fn history(&self) -> Vec<ExecutionSummary> {
        self.history
            .read()
            .await
            .iter()
            .map(ExecutionSummary::from)
            .collect()
    }

    // --- observability ---

    pub fn subscribe(&self, topic: &str) -> mpsc::Receiver<Event> {
        self.bus.subscribe(topic)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.engine.progress().register(Arc::new(callback));
    }

    pub async fn breaker_status(&self) -> Vec<BreakerStatus> {
        self.breakers.status().await
    }

    // --- engines ---

    pub async fn register_engine(&self, engine: Arc<dyn TransferEngine>) {
        self.engines.register(engine).await;
    }

    pub async fn engine(&self, name: &str) -> Result<Arc<dyn TransferEngine>> {
        self.engines
            .get(name)
            .await
            .ok_or_else(|| FerrymanError::EngineNotFound(name.to_string()))
    }

    pub async fn engine_names(&self) -> Vec<String> {
        self.engines.names().await
    }

    pub async fn available_engines(&self) -> Vec<String> {
        self.engines.available().await
    }

    // --- pipelines ---

    /// Registers a pending pipeline. Dependency errors are reported here,
    /// before anything is scheduled.
    pub async fn create_pipeline(
        &self,
        name: &str,
        config: Option<PipelineConfig>,
        jobs: Vec<Job>,
    ) -> Result<String> {
        DependencyGraph::build(&jobs)?;
        let config = config.unwrap_or_else(|| PipelineConfig {
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            ..Default::default()
        });
        let pipeline = Pipeline::new(name, config).with_jobs(jobs);
        Ok(self.register_pipeline(pipeline).await)
    }

    async fn register_pipeline(&self, pipeline: Pipeline) -> String {
        let id = pipeline.id.clone();
        info!(pipeline = %id, name = %pipeline.name, jobs = pipeline.jobs.len(), "pipeline created");
        self.pipelines.write().await.insert(
            id.clone(),
            RegisteredPipeline {
                state: Arc::new(RwLock::new(pipeline)),
                cancel: CancelHandle::new(),
            },
        );
        id
    }

    fn not_found(id: &str) -> FerrymanError {
        FerrymanError::PipelineNotFound(id.to_string())
    }

    async fn pipeline_handles(&self, id: &str) -> Result<(SharedPipeline, CancelHandle)> {
        self.pipelines
            .read()
            .await
            .get(id)
            .map(|p| (Arc::clone(&p.state), p.cancel.clone()))
            .ok_or_else(|| Self::not_found(id))
    }

    pub async fn add_job(&self, pipeline_id: &str, job: Job) -> Result<()> {
        let (state, _) = self.pipeline_handles(pipeline_id).await?;
        state.write().await.add_job(job)
    }

    /// Runs a registered pipeline to completion.
    pub async fn run_pipeline(&self, id: &str) -> Result<PipelineStatus> {
        let (state, cancel) = self.pipeline_handles(id).await?;
        self.scheduler.run(&state, &cancel).await
    }

    pub async fn pipeline(&self, id: &str) -> Result<Pipeline> {
        let (state, _) = self.pipeline_handles(id).await?;
        Ok(state.read().await.clone())
    }

    pub async fn list_pipelines(&self) -> Vec<PipelineSummary> {
        let states: Vec<SharedPipeline> = self
            .pipelines
            .read()
            .await
            .values()
            .map(|p| Arc::clone(&p.state))
            .collect();
        let mut summaries = Vec::with_capacity(states.len());
        for state in states {
            summaries.push(PipelineSummary::from(&*state.read().await));
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Stops scheduling new jobs; running jobs finish.
    pub async fn cancel_pipeline(&self, id: &str) -> Result<()> {
        let (state, cancel) = self.pipeline_handles(id).await?;
        cancel.cancel();
        let mut pipeline = state.write().await;
        if pipeline.status == PipelineStatus::Pending {
            pipeline.transition(PipelineStatus::Cancelled)?;
        }
        Ok(())
    }

    /// Drops a pipeline that isn't running.
    pub async fn remove_pipeline(&self, id: &str) -> Result<Pipeline> {
        let mut pipelines = self.pipelines.write().await;
        let entry = pipelines.get(id).ok_or_else(|| Self::not_found(id))?;
        let status = entry.state.read().await.status;
        if status == PipelineStatus::Running {
            return Err(FerrymanError::InvalidTransition {
                from: status.to_string(),
                to: "removed".into(),
            });
        }
        let removed = pipelines.remove(id).ok_or_else(|| Self::not_found(id))?;
        let pipeline = removed.state.read().await.clone();
        info!(pipeline = %id, "pipeline removed");
        Ok(pipeline)
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    /// Persists a pipeline's definition (never its run state).
    pub async fn save_pipeline(&self, id: &str) -> Result<PathBuf> {
        let definition = self.pipeline(id).await?.definition();
        self.store.save(&definition).await
    }

    /// Registers a stored definition as a fresh, pending pipeline.
    pub async fn load_pipeline(&self, id: &str) -> Result<String> {
        if self.pipelines.read().await.contains_key(id) {
            return Err(FerrymanError::Config(format!("pipeline '{id}' is already loaded")));
        }
        let definition = self.store.load(id).await?;
        let pipeline = Pipeline::from_definition(definition);
        DependencyGraph::build(&pipeline.jobs)?;
        Ok(self.register_pipeline(pipeline).await)
    }

    pub async fn stored_pipelines(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    /// Deletes a stored definition; `false` if there was none.
    pub async fn delete_stored_pipeline(&self, id: &str) -> Result<bool> {
        self.store.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::pipeline::{JobStatus, JobType};
    use crate::sim::{self, ScriptedEngine};
    use crate::workflow::{StepStatus, TRANSFER_STEP};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn orchestrator(max_workflows: usize, engine: ScriptedEngine) -> Orchestrator {
        let config = OrchestratorConfig {
            max_concurrent_workflows: max_workflows,
            ..Default::default()
        };
        Orchestrator::new(config, sim::collaborators(false, Arc::new(engine)).await)
    }

    fn workflow(name: &str) -> Workflow {
        Workflow::new(name, "/data/run-42", "s3://archive/run-42")
    }

    #[tokio::test(start_paused = true)]
    async fn execution_moves_into_history_when_done() {
        let orch = orchestrator(2, ScriptedEngine::new("s5cmd")).await;
        let id = orch.start_workflow(workflow("nightly")).await.unwrap();

        let finished = orch.wait(id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(orch.active_count().await, 0);
        assert_eq!(orch.history().await.len(), 1);
        assert_eq!(orch.status(id).await.unwrap(), ExecutionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_is_rejected_at_capacity() {
        let engine = ScriptedEngine::new("s5cmd").with_latency(Duration::from_secs(10));
        let orch = orchestrator(1, engine).await;

        let first = orch.start_workflow(workflow("a")).await.unwrap();
        match orch.start_workflow(workflow("b")).await {
            Err(FerrymanError::ConcurrencyLimitExceeded { limit }) => assert_eq!(limit, 1),
            other => panic!("expected rejection, got {other:?}"),
        }

        orch.wait(first).await.unwrap();
        let second = orch.start_workflow(workflow("b")).await.unwrap();
        assert_eq!(orch.wait(second).await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_at_next_checkpoint() {
        let engine = ScriptedEngine::new("s5cmd").with_latency(Duration::from_secs(10));
        let orch = orchestrator(2, engine).await;
        let id = orch.start_workflow(workflow("nightly")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        orch.cancel_workflow(id).await.unwrap();
        let finished = orch.wait(id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Cancelled);
        assert_eq!(finished.error.as_deref(), Some("cancelled by request"));
        // cancelling a finished execution is a no-op
        orch.cancel_workflow(id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_before_the_next_step() {
        let engine = ScriptedEngine::new("s5cmd").with_latency(Duration::from_secs(10));
        let orch = orchestrator(2, engine).await;
        let id = orch.start_workflow(workflow("nightly")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        orch.pause_workflow(id).await.unwrap();
        // the transfer in flight is not interrupted
        assert_eq!(orch.status(id).await.unwrap(), ExecutionStatus::Running);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let paused = orch.execution(id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.step(TRANSFER_STEP).unwrap().status, StepStatus::Completed);
        assert_eq!(paused.steps.last().unwrap().status, StepStatus::Pending);

        orch.resume_workflow(id).await.unwrap();
        let finished = orch.wait(id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
        let kinds: Vec<EventKind> = finished.events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::WorkflowPaused));
        assert!(kinds.contains(&EventKind::WorkflowResumed));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_execution_can_be_cancelled() {
        let engine = ScriptedEngine::new("s5cmd").with_latency(Duration::from_secs(10));
        let orch = orchestrator(2, engine).await;
        let id = orch.start_workflow(workflow("nightly")).await.unwrap();
        orch.pause_workflow(id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(orch.status(id).await.unwrap(), ExecutionStatus::Paused);

        orch.cancel_workflow(id).await.unwrap();
        let finished = orch.wait(id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Cancelled);
        assert!(matches!(
            orch.pause_workflow(id).await,
            Err(FerrymanError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_timeout_override_sets_deadline() {
        let engine = ScriptedEngine::new("s5cmd").with_latency(Duration::from_secs(120));
        let orch = orchestrator(2, engine).await;
        let id = orch
            .start_workflow(workflow("nightly").with_timeout("1m"))
            .await
            .unwrap();
        let finished = orch.wait(id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Cancelled);
        assert_eq!(finished.error.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn invalid_timeout_is_rejected_at_start() {
        let orch = orchestrator(2, ScriptedEngine::new("s5cmd")).await;
        let result = orch.start_workflow(workflow("nightly").with_timeout("whenever")).await;
        assert!(matches!(result, Err(FerrymanError::InvalidTimeout(_))));
        assert_eq!(orch.active_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let orch = orchestrator(2, ScriptedEngine::new("s5cmd")).await;
        let id = Uuid::new_v4();
        assert!(matches!(
            orch.execution(id).await,
            Err(FerrymanError::ExecutionNotFound(_))
        ));
        assert!(orch.cancel_workflow(id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let config = OrchestratorConfig {
            history_limit: 2,
            ..Default::default()
        };
        let orch = Orchestrator::new(
            config,
            sim::collaborators(false, Arc::new(ScriptedEngine::new("s5cmd"))).await,
        );
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let id = orch.start_workflow(workflow(name)).await.unwrap();
            orch.wait(id).await.unwrap();
            ids.push(id);
        }
        let history = orch.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].workflow, "b");
        assert!(orch.execution(ids[0]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_callbacks_see_every_step() {
        let orch = orchestrator(2, ScriptedEngine::new("s5cmd")).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        orch.on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = orch.start_workflow(workflow("nightly")).await.unwrap();
        orch.wait(id).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn engine_registry_operations() {
        let orch = orchestrator(2, ScriptedEngine::new("s5cmd")).await;
        orch.register_engine(Arc::new(ScriptedEngine::new("rclone").unavailable()))
            .await;
        assert_eq!(orch.engine_names().await, vec!["rclone", "s5cmd"]);
        assert_eq!(orch.available_engines().await, vec!["s5cmd"]);
        assert!(orch.engine("rclone").await.is_ok());
        assert!(matches!(
            orch.engine("aspera").await,
            Err(FerrymanError::EngineNotFound(_))
        ));
    }

    fn transfer_jobs() -> Vec<Job> {
        vec![
            Job::new("fetch", JobType::Download)
                .with_id("fetch")
                .with_config("engine", "s5cmd")
                .with_config("source", "/data/in")
                .with_config("destination", "s3://archive/in"),
            Job::new("push", JobType::Upload)
                .with_id("push")
                .depends_on("fetch")
                .with_config("engine", "s5cmd")
                .with_config("source", "/data/out")
                .with_config("destination", "s3://archive/out"),
        ]
    }

    #[tokio::test]
    async fn pipeline_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let orch = Orchestrator::new(
            config,
            sim::collaborators(false, Arc::new(ScriptedEngine::new("s5cmd"))).await,
        );

        let id = orch.create_pipeline("sync", None, transfer_jobs()).await.unwrap();
        let path = orch.save_pipeline(&id).await.unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(orch.stored_pipelines().await.unwrap(), vec![id.clone()]);

        assert_eq!(orch.run_pipeline(&id).await.unwrap(), PipelineStatus::Completed);
        let pipeline = orch.pipeline(&id).await.unwrap();
        assert_eq!(pipeline.count(JobStatus::Completed), 2);

        // loading while registered is refused; after removal it comes back pending
        assert!(orch.load_pipeline(&id).await.is_err());
        orch.remove_pipeline(&id).await.unwrap();
        assert!(orch.list_pipelines().await.is_empty());
        let reloaded = orch.load_pipeline(&id).await.unwrap();
        assert_eq!(reloaded, id);
        assert_eq!(orch.pipeline(&id).await.unwrap().status, PipelineStatus::Pending);

        assert!(orch.delete_stored_pipeline(&id).await.unwrap());
        assert!(orch.stored_pipelines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cyclic_pipeline_is_rejected_at_creation() {
        let orch = orchestrator(2, ScriptedEngine::new("s5cmd")).await;
        let jobs = vec![
            Job::new("a", JobType::Upload).with_id("a").depends_on("b"),
            Job::new("b", JobType::Upload).with_id("b").depends_on("a"),
        ];
        assert!(matches!(
            orch.create_pipeline("loop", None, jobs).await,
            Err(FerrymanError::CycleDetected { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_pending_pipeline_never_runs() {
        let orch = orchestrator(2, ScriptedEngine::new("s5cmd")).await;
        let id = orch.create_pipeline("sync", None, transfer_jobs()).await.unwrap();
        orch.cancel_pipeline(&id).await.unwrap();
        assert_eq!(orch.pipeline(&id).await.unwrap().status, PipelineStatus::Cancelled);
        assert!(orch.run_pipeline(&id).await.is_err());
        assert!(matches!(
            orch.pipeline("missing").await,
            Err(FerrymanError::PipelineNotFound(_))
        ));
    }
}

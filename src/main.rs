use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ferryman::cli::{Cli, Command};
use ferryman::events::ALL_TOPICS;
use ferryman::orchestrator::PipelineSummary;
use ferryman::pipeline::{Pipeline, PipelineStore};
use ferryman::sim::{self, ScriptedEngine};
use ferryman::ui::{self, WorkflowProgress};
use ferryman::workflow::{
    ExecutionStatus, ProjectDefinition, StepDefinition, StepKind, Workflow, build_plan, keys,
};
use ferryman::{Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Command::Validate { file } => validate(&file),
        Command::Demo { bundle, failures } => demo(config, bundle, failures).await,
        Command::Pipelines => list_pipelines(&config).await,
        Command::ShowPipeline { id } => show_pipeline(&config, &id).await,
    }
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestratorConfig::load()?,
    };
    if let Some(max) = cli.max_workflows {
        config.max_concurrent_workflows = max;
        config.validate()?;
    }
    Ok(config)
}

fn validate(file: &std::path::Path) -> Result<()> {
    let project = ProjectDefinition::load(file)
        .with_context(|| format!("reading project {}", file.display()))?;
    let workflows = project.resolve_all()?;
    for workflow in &workflows {
        workflow.validate()?;
        workflow.timeout()?;
        let steps = build_plan(workflow)?;
        ui::print_plan(&workflow.name, &steps);
    }
    println!("{} workflow(s) in '{}' are valid", workflows.len(), project.name);
    Ok(())
}

async fn demo(config: OrchestratorConfig, bundle: bool, failures: u32) -> Result<()> {
    let engine = ScriptedEngine::new(config.default_engine.clone())
        .with_latency(Duration::from_millis(400))
        .failing_with((0..failures).map(|i| format!("connection timeout on part {}", i + 1)));
    let collaborators = sim::collaborators(bundle, Arc::new(engine)).await;
    let orchestrator = Orchestrator::new(config, collaborators);

    let workflow = Workflow::new("demo", "/data/demo-run", "s3://ferryman-demo/demo-run")
        .with_preprocessing(StepDefinition::new("bundle", StepKind::Bundle))
        .with_postprocessing(StepDefinition::new("validate", StepKind::Validate))
        .with_postprocessing(
            StepDefinition::new("cleanup", StepKind::Cleanup)
                .after("validate")
                .continue_on_failure(),
        );

    let progress = WorkflowProgress::start(&workflow.name);
    let on_update = progress.clone();
    orchestrator.on_progress(move |update| on_update.update(update));

    let mut events = orchestrator.subscribe(ALL_TOPICS);
    let on_event = progress.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            on_event.event(&event);
        }
    });

    let id = orchestrator.start_workflow(workflow).await?;
    info!(execution_id = %id, "demo workflow started");
    let execution = orchestrator.wait(id).await?;

    // closing the bus ends the printer once it has drained
    drop(orchestrator);
    let _ = printer.await;

    progress.finish(&execution);
    if let Some(report) = execution.results.get(keys::REPORT) {
        ui::print_report(report);
    }
    if execution.status != ExecutionStatus::Completed {
        bail!("demo workflow ended {}", execution.status);
    }
    Ok(())
}

async fn list_pipelines(config: &OrchestratorConfig) -> Result<()> {
    let store = PipelineStore::new(&config.state_dir);
    let ids = store.list().await?;
    if ids.is_empty() {
        println!("no stored pipelines under {}", store.root().display());
        return Ok(());
    }
    for id in ids {
        let pipeline = Pipeline::from_definition(store.load(&id).await?);
        ui::print_pipeline_summary(&PipelineSummary::from(&pipeline));
    }
    Ok(())
}

async fn show_pipeline(config: &OrchestratorConfig, id: &str) -> Result<()> {
    let store = PipelineStore::new(&config.state_dir);
    let pipeline = Pipeline::from_definition(store.load(id).await?);
    ui::print_pipeline(&pipeline);
    Ok(())
}

//! Step execution, dispatched on [`StepKind`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::definition::{AUTO_ENGINE, Workflow};
use super::step::{Step, StepKind, StepStatus};
use crate::cancel::CancelHandle;
use crate::collaborators::{
    BundleRequest, BundleResult, Collaborators, DataPattern, Recommendations, TransferEngine,
    TransferRequest, WarningReport,
};
use crate::error::FerrymanError;
use crate::pipeline::{Job, JobType, Pipeline, PipelineConfig, PipelineStatus, Scheduler};

/// Result keys shared between steps.
pub mod keys {
    pub const PATTERN: &str = "pattern";
    pub const RECOMMENDATIONS: &str = "recommendations";
    pub const WARNINGS: &str = "warnings";
    pub const BUNDLE: &str = "bundle";
    pub const TRANSFER: &str = "transfer";
    pub const VALIDATION: &str = "validation";
    pub const CLEANUP: &str = "cleanup";
    pub const REPORT: &str = "report";
    pub const QUICK_FIXES: &str = "quick_fixes";
}

/// What a step handler may read while it runs.
pub struct StepContext<'a> {
    pub execution_id: Uuid,
    pub workflow: &'a Workflow,
    /// Results accumulated by the steps before this one.
    pub results: &'a Map<String, Value>,
    /// Snapshot of every step's state when this one started.
    pub steps: &'a [Step],
    pub collaborators: &'a Collaborators,
    pub scheduler: &'a Scheduler,
    pub cancel: &'a CancelHandle,
    pub default_engine: &'a str,
    pub max_concurrent_jobs: usize,
}

impl StepContext<'_> {
    fn result<T: DeserializeOwned>(&self, key: &str) -> Option<Result<T>> {
        self.results.get(key).map(|value| {
            serde_json::from_value(value.clone())
                .with_context(|| format!("malformed '{key}' result"))
        })
    }

    fn require<T: DeserializeOwned>(&self, key: &str, producer: &str) -> Result<T> {
        self.result(key).unwrap_or_else(|| {
            Err(anyhow!(
                "missing required '{key}' result; the {producer} step must run first"
            ))
        })
    }
}

/// A step either completes with outputs or declines to run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        output: Map<String, Value>,
    },
    /// Not a failure: the step decided it had nothing to do.
    Skipped {
        reason: String,
        output: Map<String, Value>,
    },
}

impl StepOutcome {
    fn completed(output: Map<String, Value>) -> Self {
        StepOutcome::Completed { output }
    }

    pub fn output(&self) -> &Map<String, Value> {
        match self {
            StepOutcome::Completed { output } | StepOutcome::Skipped { output, .. } => output,
        }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutcome>;
}

/// One handler per [`StepKind`], every kind covered.
#[derive(Clone)]
pub struct StepHandlers {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl Default for StepHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandlers {
    pub fn new() -> Self {
        let handlers = StepKind::ALL
            .into_iter()
            .map(|kind| {
                let handler: Arc<dyn StepHandler> = match kind {
                    StepKind::Analyze => Arc::new(AnalyzeHandler),
                    StepKind::Bundle => Arc::new(BundleHandler),
                    StepKind::Transfer => Arc::new(TransferHandler),
                    StepKind::Validate => Arc::new(ValidateHandler),
                    StepKind::Cleanup => Arc::new(CleanupHandler),
                    StepKind::Report => Arc::new(ReportHandler),
                };
                (kind, handler)
            })
            .collect();
        Self { handlers }
    }

    pub fn with_handler(mut self, kind: StepKind, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: StepKind) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow!("handler for {kind} steps is not registered"))
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

struct AnalyzeHandler;

#[async_trait]
impl StepHandler for AnalyzeHandler {
    async fn execute(&self, _step: &Step, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let pattern = ctx
            .collaborators
            .analyzer
            .analyze_pattern(&ctx.workflow.source)
            .await
            .with_context(|| format!("analysis of {} failed", ctx.workflow.source.display()))?;
        info!(
            source = %ctx.workflow.source.display(),
            files = pattern.total_files,
            bytes = pattern.total_size_bytes,
            "dataset analyzed"
        );

        let mut output = Map::new();
        output.insert(keys::PATTERN.into(), to_value(&pattern)?);

        let recommendations = match &ctx.collaborators.recommender {
            Some(recommender) => Some(recommender.recommend(&pattern).await?),
            None => None,
        };
        if let Some(warnings) = &ctx.collaborators.warnings {
            let cost = recommendations.as_ref().and_then(|r| r.cost.as_ref());
            let report = warnings.analyze_pattern(&pattern, cost);
            output.insert(keys::WARNINGS.into(), to_value(&report)?);
        }
        if let Some(recommendations) = recommendations {
            output.insert(keys::RECOMMENDATIONS.into(), to_value(&recommendations)?);
        }
        Ok(StepOutcome::completed(output))
    }
}

struct BundleHandler;

#[async_trait]
impl StepHandler for BundleHandler {
    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let pattern: DataPattern = ctx.require(keys::PATTERN, "analyze")?;
        let recommendation = ctx.collaborators.bundler.should_bundle(&pattern).await;
        if !recommendation.recommended {
            debug!(reason = %recommendation.reason, "bundling not recommended");
            let mut output = Map::new();
            output.insert("recommendation".into(), to_value(&recommendation)?);
            return Ok(StepOutcome::Skipped {
                reason: recommendation.reason,
                output,
            });
        }

        let staging_dir = step
            .config_str("staging_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join(format!("ferryman-{}", ctx.execution_id)));
        let target_bundle_size_bytes = step
            .config
            .get("target_bundle_size_bytes")
            .and_then(Value::as_u64)
            .unwrap_or(recommendation.target_bundle_size_bytes);
        let request = BundleRequest {
            source: ctx.workflow.source.clone(),
            staging_dir,
            pattern,
            target_bundle_size_bytes,
            compression: step.config_str("compression").map(str::to_string),
        };
        let result = ctx
            .collaborators
            .bundler
            .process_for_bundling(&request)
            .await
            .context("bundling failed")?;
        info!(
            bundles = result.bundles.len(),
            compression_ratio = result.compression_ratio(),
            "dataset bundled"
        );

        let mut output = Map::new();
        output.insert("compression_ratio".into(), json!(result.compression_ratio()));
        output.insert("cost_savings".into(), json!(result.estimated_cost_savings));
        output.insert(keys::BUNDLE.into(), to_value(&result)?);
        Ok(StepOutcome::completed(output))
    }
}

struct TransferHandler;

impl TransferHandler {
    /// Explicit name, else the top recommendation, else the configured default.
    fn engine_name(step: &Step, ctx: &StepContext<'_>) -> String {
        let requested = step.engine.as_deref().unwrap_or(AUTO_ENGINE);
        if requested != AUTO_ENGINE {
            return requested.to_string();
        }
        ctx.result::<Recommendations>(keys::RECOMMENDATIONS)
            .and_then(Result::ok)
            .and_then(|r| r.engines.into_iter().next())
            .unwrap_or_else(|| ctx.default_engine.to_string())
    }

    async fn resolve(step: &Step, ctx: &StepContext<'_>) -> Result<Arc<dyn TransferEngine>> {
        let name = Self::engine_name(step, ctx);
        let engine = ctx
            .collaborators
            .engines
            .get(&name)
            .await
            .ok_or_else(|| FerrymanError::EngineNotFound(name.clone()))?;
        if !engine.is_available().await {
            bail!("transfer engine '{name}' is temporarily unavailable");
        }
        Ok(engine)
    }

    async fn fan_out(
        engine: &str,
        bundles: &[PathBuf],
        ctx: &StepContext<'_>,
        options: &Map<String, Value>,
    ) -> Result<Value> {
        let jobs = bundles.iter().map(|bundle| {
            let file_name = bundle
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let destination = format!("{}/{file_name}", ctx.workflow.destination.trim_end_matches('/'));
            let mut job = Job::new(format!("upload {file_name}"), JobType::Upload)
                .with_config("engine", engine)
                .with_config("source", bundle.to_string_lossy().into_owned())
                .with_config("destination", destination);
            for (key, value) in options {
                job.config.entry(key.clone()).or_insert_with(|| value.clone());
            }
            job
        });
        let pipeline = Pipeline::new(
            format!("{}-transfer", ctx.workflow.name),
            PipelineConfig {
                max_concurrent_jobs: ctx.max_concurrent_jobs,
                ..Default::default()
            },
        )
        .with_jobs(jobs);
        let pipeline_id = pipeline.id.clone();
        let shared = Arc::new(RwLock::new(pipeline));

        let status = ctx.scheduler.run(&shared, &ctx.cancel.child()).await?;
        let pipeline = shared.read().await;
        if status != PipelineStatus::Completed {
            // each job already ran under its own retry policy
            let errors = pipeline
                .jobs
                .iter()
                .filter_map(|j| j.error.as_ref().map(|e| format!("{}: {e}", j.name)))
                .collect();
            return Err(FerrymanError::PipelineFailed {
                pipeline: pipeline.name.clone(),
                status: status.to_string(),
                errors,
            }
            .into());
        }

        let (bytes, files) = pipeline
            .jobs
            .iter()
            .filter_map(|j| j.result.as_ref())
            .fold((0u64, 0u64), |(bytes, files), result| {
                (
                    bytes + result["bytes_transferred"].as_u64().unwrap_or(0),
                    files + result["files_transferred"].as_u64().unwrap_or(0),
                )
            });
        Ok(json!({
            "engine": engine,
            "pipeline_id": pipeline_id,
            "jobs": pipeline.jobs.len(),
            "bytes_transferred": bytes,
            "files_transferred": files,
        }))
    }
}

#[async_trait]
impl StepHandler for TransferHandler {
    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let engine = Self::resolve(step, ctx).await?;
        let bundles = ctx
            .result::<BundleResult>(keys::BUNDLE)
            .transpose()?
            .map(|b| b.bundles)
            .unwrap_or_default();

        let mut options = step.config.clone();
        if let Some(class) = &ctx.workflow.storage_class {
            options
                .entry("storage_class")
                .or_insert_with(|| Value::String(class.clone()));
        }

        let transfer = if bundles.len() > 1 {
            info!(engine = engine.name(), bundles = bundles.len(), "uploading bundles");
            Self::fan_out(engine.name(), &bundles, ctx, &options).await?
        } else {
            let source = bundles
                .into_iter()
                .next()
                .unwrap_or_else(|| ctx.workflow.source.clone());
            let request = TransferRequest {
                id: format!("{}-{}", ctx.execution_id, step.name),
                source,
                destination: ctx.workflow.destination.clone(),
                options,
            };
            info!(engine = engine.name(), source = %request.source.display(), "uploading");
            let result = engine
                .upload(&request)
                .await
                .with_context(|| format!("upload via {} failed", engine.name()))?;
            to_value(&result)?
        };

        let mut output = Map::new();
        output.insert("engine".into(), json!(engine.name()));
        output.insert(keys::TRANSFER.into(), transfer);
        Ok(StepOutcome::completed(output))
    }
}

struct ValidateHandler;

#[async_trait]
impl StepHandler for ValidateHandler {
    async fn execute(&self, _step: &Step, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let transfer: Value = ctx.require(keys::TRANSFER, "transfer")?;
        let bytes = transfer["bytes_transferred"].as_u64().unwrap_or(0);
        let expected = ctx
            .result::<DataPattern>(keys::PATTERN)
            .and_then(Result::ok)
            .map(|p| p.total_size_bytes)
            .unwrap_or(0);

        // bundles are compressed, so byte counts are only checked for emptiness
        if bytes == 0 && expected > 0 {
            bail!("transfer incomplete: nothing uploaded out of {expected} bytes");
        }

        let mut output = Map::new();
        output.insert(
            keys::VALIDATION.into(),
            json!({ "verified": true, "bytes_transferred": bytes }),
        );
        Ok(StepOutcome::completed(output))
    }
}

/// Removes the bundle staging directory, when there is one.
struct CleanupHandler;

#[async_trait]
impl StepHandler for CleanupHandler {
    async fn execute(&self, _step: &Step, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let Some(bundle) = ctx.result::<BundleResult>(keys::BUNDLE).transpose()? else {
            let mut output = Map::new();
            output.insert(keys::CLEANUP.into(), json!({ "removed": false }));
            return Ok(StepOutcome::completed(output));
        };
        let removed = match tokio::fs::remove_dir_all(&bundle.output_dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("cleanup of {} failed", bundle.output_dir.display())
                });
            }
        };
        let mut output = Map::new();
        output.insert(
            keys::CLEANUP.into(),
            json!({ "path": bundle.output_dir, "removed": removed }),
        );
        Ok(StepOutcome::completed(output))
    }
}

struct ReportHandler;

#[async_trait]
impl StepHandler for ReportHandler {
    async fn execute(&self, step: &Step, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let others: Vec<&Step> = ctx.steps.iter().filter(|s| s.name != step.name).collect();
        let count = |status: StepStatus| others.iter().filter(|s| s.status == status).count();
        let completed = count(StepStatus::Completed);
        let failed = count(StepStatus::Failed);
        let skipped = count(StepStatus::Skipped);
        let attempted = completed + failed;
        let success_rate = if attempted == 0 {
            1.0
        } else {
            completed as f64 / attempted as f64
        };

        let quick_fixes = ctx
            .result::<WarningReport>(keys::WARNINGS)
            .and_then(Result::ok)
            .map(|r| r.quick_fixes)
            .unwrap_or_default();
        let statuses: Map<String, Value> = others
            .iter()
            .map(|s| (s.name.clone(), json!(s.status)))
            .collect();

        let mut output = Map::new();
        output.insert(
            keys::REPORT.into(),
            json!({
                "workflow": ctx.workflow.name,
                "success_rate": success_rate,
                "completed": completed,
                "failed": failed,
                "skipped": skipped,
                "steps": statuses,
            }),
        );
        output.insert(keys::QUICK_FIXES.into(), json!(quick_fixes));
        Ok(StepOutcome::completed(output))
    }
}

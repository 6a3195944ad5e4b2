//! Job execution, dispatched on [`JobType`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::job::{Job, JobType};
use crate::collaborators::{EngineRegistry, TransferEngine, TransferRequest};

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<Value>;
}

/// One handler per [`JobType`]. Built with every type covered; individual
/// entries can be replaced.
#[derive(Clone)]
pub struct JobHandlers {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl JobHandlers {
    pub fn new(engines: Arc<EngineRegistry>) -> Self {
        let handlers = JobType::ALL
            .into_iter()
            .map(|job_type| {
                let handler: Arc<dyn JobHandler> = match job_type {
                    JobType::Download => Arc::new(TransferHandler {
                        engines: Arc::clone(&engines),
                        direction: Direction::Download,
                    }),
                    JobType::Upload => Arc::new(TransferHandler {
                        engines: Arc::clone(&engines),
                        direction: Direction::Upload,
                    }),
                    JobType::Transform => Arc::new(UnregisteredTransform),
                    JobType::Validate => Arc::new(PathExistsHandler),
                    JobType::Cleanup => Arc::new(RemovePathHandler),
                };
                (job_type, handler)
            })
            .collect();
        Self { handlers }
    }

    pub fn with_handler(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or_else(|| anyhow!("handler for {job_type} jobs is not registered"))
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upload,
    Download,
}

struct TransferHandler {
    engines: Arc<EngineRegistry>,
    direction: Direction,
}

impl TransferHandler {
    async fn engine(&self, job: &Job) -> Result<Arc<dyn TransferEngine>> {
        let name = job
            .config_str("engine")
            .ok_or_else(|| anyhow!("missing required job config 'engine' for '{}'", job.name))?;
        let engine = self
            .engines
            .get(name)
            .await
            .ok_or_else(|| anyhow!("transfer engine '{name}' is not registered"))?;
        if !engine.is_available().await {
            bail!("transfer engine '{name}' is temporarily unavailable");
        }
        Ok(engine)
    }
}

#[async_trait]
impl JobHandler for TransferHandler {
    async fn run(&self, job: &Job) -> Result<Value> {
        let engine = self.engine(job).await?;
        let source = job
            .config_str("source")
            .ok_or_else(|| anyhow!("missing required job config 'source' for '{}'", job.name))?;
        let destination = job.config_str("destination").ok_or_else(|| {
            anyhow!("missing required job config 'destination' for '{}'", job.name)
        })?;
        let request = TransferRequest {
            id: job.id.clone(),
            source: PathBuf::from(source),
            destination: destination.to_string(),
            options: job.config.clone(),
        };
        debug!(job = %job.name, engine = engine.name(), direction = ?self.direction, "starting transfer");
        let result = match self.direction {
            Direction::Upload => engine.upload(&request).await,
            Direction::Download => engine.download(&request).await,
        }
        .with_context(|| format!("{} of {source} failed", job.job_type))?;
        Ok(serde_json::to_value(result)?)
    }
}

struct UnregisteredTransform;

#[async_trait]
impl JobHandler for UnregisteredTransform {
    async fn run(&self, job: &Job) -> Result<Value> {
        bail!("no transform handler registered for job '{}'", job.name)
    }
}

/// Checks the local path in `config.path` exists.
struct PathExistsHandler;

#[async_trait]
impl JobHandler for PathExistsHandler {
    async fn run(&self, job: &Job) -> Result<Value> {
        let path = job
            .config_str("path")
            .ok_or_else(|| anyhow!("missing required job config 'path' for '{}'", job.name))?;
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("validation of {path} failed"))?;
        Ok(json!({ "path": path, "bytes": metadata.len(), "is_dir": metadata.is_dir() }))
    }
}

/// Removes the local path in `config.path`. A path that's already gone is fine.
struct RemovePathHandler;

#[async_trait]
impl JobHandler for RemovePathHandler {
    async fn run(&self, job: &Job) -> Result<Value> {
        let path = job
            .config_str("path")
            .ok_or_else(|| anyhow!("missing required job config 'path' for '{}'", job.name))?;
        let removed = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                tokio::fs::remove_dir_all(path).await?;
                true
            }
            Ok(_) => {
                tokio::fs::remove_file(path).await?;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e).with_context(|| format!("cleanup of {path} failed")),
        };
        Ok(json!({ "path": path, "removed": removed }))
    }
}

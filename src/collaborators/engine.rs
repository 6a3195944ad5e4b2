use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::types::{
    EngineCapabilities, EngineKind, TransferProgress, TransferRequest, TransferResult,
};

/// Capability contract of a transfer tool. The core never depends on a
/// concrete tool, only on this trait.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> EngineKind;

    async fn is_available(&self) -> bool;

    fn capabilities(&self) -> EngineCapabilities;

    async fn upload(&self, request: &TransferRequest) -> Result<TransferResult>;

    async fn download(&self, request: &TransferRequest) -> Result<TransferResult>;

    async fn sync(&self, request: &TransferRequest) -> Result<TransferResult>;

    async fn progress(&self, transfer_id: &str) -> Option<TransferProgress>;

    async fn cancel(&self, transfer_id: &str) -> Result<()>;

    /// Checks the engine's own configuration (binary present, credentials set).
    async fn validate(&self) -> Result<()>;
}

/// Registered transfer engines, keyed by name.
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn TransferEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `engine`, replacing any engine of the same name.
    pub async fn register(&self, engine: Arc<dyn TransferEngine>) {
        let name = engine.name().to_string();
        info!(engine = %name, kind = ?engine.kind(), "transfer engine registered");
        self.engines.write().await.insert(name, engine);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn TransferEngine>> {
        self.engines.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.engines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of engines currently reporting themselves available.
    pub async fn available(&self) -> Vec<String> {
        let engines: Vec<_> = self.engines.read().await.values().cloned().collect();
        let mut names = Vec::new();
        for engine in engines {
            if engine.is_available().await {
                names.push(engine.name().to_string());
            }
        }
        names.sort();
        names
    }
}

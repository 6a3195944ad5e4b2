//! Contracts of the collaborators the orchestration core drives.
//!
//! Pattern analysis, bundling, diagnostics and transfer tools live outside
//! the core. Steps and jobs reach them only through these traits, so tests
//! and the `demo` command can swap in the in-memory versions from
//! [`crate::sim`].

mod engine;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use engine::{EngineRegistry, TransferEngine};
pub use types::{
    BundleRecommendation, BundleRequest, BundleResult, CostAnalysis, DataPattern,
    EngineCapabilities, EngineKind, Recommendations, TransferProgress, TransferRequest,
    TransferResult, Warning, WarningReport,
};

#[async_trait]
pub trait PatternAnalyzer: Send + Sync {
    async fn analyze_pattern(&self, path: &Path) -> Result<DataPattern>;
}

#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, pattern: &DataPattern) -> Result<Recommendations>;
}

#[async_trait]
pub trait BundleAdvisor: Send + Sync {
    async fn should_bundle(&self, pattern: &DataPattern) -> BundleRecommendation;

    async fn process_for_bundling(&self, request: &BundleRequest) -> Result<BundleResult>;
}

pub trait WarningAnalyzer: Send + Sync {
    fn analyze_pattern(&self, pattern: &DataPattern, cost: Option<&CostAnalysis>)
    -> WarningReport;
}

/// Everything the step handlers call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn PatternAnalyzer>,
    pub bundler: Arc<dyn BundleAdvisor>,
    pub recommender: Option<Arc<dyn Recommender>>,
    pub warnings: Option<Arc<dyn WarningAnalyzer>>,
    pub engines: Arc<EngineRegistry>,
}

impl Collaborators {
    pub fn new(
        analyzer: Arc<dyn PatternAnalyzer>,
        bundler: Arc<dyn BundleAdvisor>,
        engines: Arc<EngineRegistry>,
    ) -> Self {
        Self {
            analyzer,
            bundler,
            recommender: None,
            warnings: None,
            engines,
        }
    }

    pub fn with_recommender(mut self, recommender: Arc<dyn Recommender>) -> Self {
        self.recommender = Some(recommender);
        self
    }

    pub fn with_warnings(mut self, warnings: Arc<dyn WarningAnalyzer>) -> Self {
        self.warnings = Some(warnings);
        self
    }
}

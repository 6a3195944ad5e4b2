//! In-memory collaborators with scripted behaviour.
//!
//! Backs the `demo` command and the test suites: no filesystem walks, no
//! external tools, just deterministic answers and a configurable list of
//! failures for each engine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::collaborators::{
    BundleAdvisor, BundleRecommendation, BundleRequest, BundleResult, Collaborators, CostAnalysis,
    DataPattern, EngineCapabilities, EngineKind, EngineRegistry, PatternAnalyzer,
    Recommendations, Recommender, TransferEngine, TransferProgress, TransferRequest,
    TransferResult, Warning, WarningAnalyzer, WarningReport,
};

/// A genomics-style dataset with many small files.
pub fn sample_pattern() -> DataPattern {
    DataPattern {
        source: PathBuf::from("/data/run-42"),
        total_files: 12_000,
        total_size_bytes: 48 * 1024 * 1024 * 1024,
        small_file_count: 9_500,
        largest_file_bytes: 6 * 1024 * 1024 * 1024,
        domain: Some("genomics".into()),
        extensions: BTreeMap::from([("fastq.gz".into(), 2_500), ("json".into(), 9_500)]),
    }
}

pub struct StaticAnalyzer {
    pattern: DataPattern,
    failure: Option<String>,
}

impl StaticAnalyzer {
    pub fn new(pattern: DataPattern) -> Self {
        Self {
            pattern,
            failure: None,
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            pattern: DataPattern::default(),
            failure: Some(message.into()),
        }
    }
}

#[async_trait]
impl PatternAnalyzer for StaticAnalyzer {
    async fn analyze_pattern(&self, path: &Path) -> Result<DataPattern> {
        if let Some(message) = &self.failure {
            return Err(anyhow!("{message}"));
        }
        Ok(DataPattern {
            source: path.to_path_buf(),
            ..self.pattern.clone()
        })
    }
}

pub struct StaticRecommender(pub Recommendations);

#[async_trait]
impl Recommender for StaticRecommender {
    async fn recommend(&self, _pattern: &DataPattern) -> Result<Recommendations> {
        Ok(self.0.clone())
    }
}

/// Recommends bundling or not, and produces `bundles` archive names when asked.
pub struct FixedBundleAdvisor {
    recommended: bool,
    bundles: usize,
    processed: AtomicU32,
}

impl FixedBundleAdvisor {
    pub fn new(recommended: bool, bundles: usize) -> Self {
        Self {
            recommended,
            bundles,
            processed: AtomicU32::new(0),
        }
    }

    pub fn processed(&self) -> u32 {
        self.processed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleAdvisor for FixedBundleAdvisor {
    async fn should_bundle(&self, pattern: &DataPattern) -> BundleRecommendation {
        let reason = if self.recommended {
            format!(
                "{:.0}% of files are under 1 MiB",
                pattern.small_file_ratio() * 100.0
            )
        } else {
            "files are already large enough to transfer individually".to_string()
        };
        BundleRecommendation {
            recommended: self.recommended,
            reason,
            target_bundle_size_bytes: 1024 * 1024 * 1024,
            estimated_bundles: self.bundles as u64,
        }
    }

    async fn process_for_bundling(&self, request: &BundleRequest) -> Result<BundleResult> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        let bundles = (0..self.bundles)
            .map(|i| request.staging_dir.join(format!("bundle-{i:04}.tar.zst")))
            .collect();
        Ok(BundleResult {
            bundles,
            output_dir: request.staging_dir.clone(),
            original_bytes: request.pattern.total_size_bytes,
            bundled_bytes: request.pattern.total_size_bytes / 3,
            estimated_cost_savings: request.pattern.small_file_count as f64 * 0.000_005,
        })
    }
}

pub struct StaticWarnings(pub WarningReport);

impl StaticWarnings {
    pub fn with_quick_fix(fix: impl Into<String>) -> Self {
        Self(WarningReport {
            warnings: vec![Warning {
                code: "small-files".into(),
                message: "many small files will inflate request costs".into(),
            }],
            quick_fixes: vec![fix.into()],
        })
    }
}

impl WarningAnalyzer for StaticWarnings {
    fn analyze_pattern(&self, _pattern: &DataPattern, _cost: Option<&CostAnalysis>) -> WarningReport {
        self.0.clone()
    }
}

/// A transfer engine that fails with scripted messages before succeeding.
pub struct ScriptedEngine {
    name: String,
    available: bool,
    latency: Duration,
    failures: Mutex<VecDeque<String>>,
    /// Destination fragments that always fail, with their message.
    broken: Vec<(String, String)>,
    attempts: Mutex<Vec<String>>,
    calls: AtomicU32,
    requests: Mutex<Vec<TransferRequest>>,
    progress: Mutex<HashMap<String, TransferProgress>>,
}

impl ScriptedEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: true,
            latency: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            broken: Vec::new(),
            attempts: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next calls fail with these messages, in order.
    pub fn failing_with<I, S>(self, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(messages.into_iter().map(Into::into));
        self
    }

    /// Every call whose destination contains `fragment` fails with `message`.
    pub fn failing_for(mut self, fragment: impl Into<String>, message: impl Into<String>) -> Self {
        self.broken.push((fragment.into(), message.into()));
        self
    }

    /// Calls made against destinations containing `fragment`, failed or not.
    pub fn attempts_for(&self, fragment: &str) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|destination| destination.contains(fragment))
            .count()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.destination.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some((_, message)) = self
            .broken
            .iter()
            .find(|(fragment, _)| request.destination.contains(fragment.as_str()))
        {
            return Err(anyhow!("{message}"));
        }
        let next_failure = self
            .failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(message) = next_failure {
            return Err(anyhow!("{message}"));
        }
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        self.progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                request.id.clone(),
                TransferProgress {
                    id: request.id.clone(),
                    bytes_done: 1024,
                    bytes_total: 1024,
                },
            );
        Ok(TransferResult {
            id: request.id.clone(),
            engine: self.name.clone(),
            bytes_transferred: 1024,
            files_transferred: 1,
            duration_ms: self.latency.as_millis() as u64,
        })
    }
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Simulated
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            sync: true,
            max_concurrency: 8,
            ..Default::default()
        }
    }

    async fn upload(&self, request: &TransferRequest) -> Result<TransferResult> {
        self.transfer(request).await
    }

    async fn download(&self, request: &TransferRequest) -> Result<TransferResult> {
        self.transfer(request).await
    }

    async fn sync(&self, request: &TransferRequest) -> Result<TransferResult> {
        self.transfer(request).await
    }

    async fn progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        self.progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(transfer_id)
            .cloned()
    }

    async fn cancel(&self, _transfer_id: &str) -> Result<()> {
        Ok(())
    }

    async fn validate(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(anyhow!("engine '{}' is not configured", self.name))
        }
    }
}

/// Collaborators for a dataset that does (or doesn't) want bundling, with
/// `engine` registered as the only transfer engine.
pub async fn collaborators(bundle: bool, engine: Arc<ScriptedEngine>) -> Collaborators {
    collaborators_with(FixedBundleAdvisor::new(bundle, 1), engine).await
}

/// Like [`collaborators`], with a caller-chosen bundle advisor.
pub async fn collaborators_with(advisor: FixedBundleAdvisor, engine: Arc<ScriptedEngine>) -> Collaborators {
    let engines = Arc::new(EngineRegistry::new());
    let engine_name = engine.name().to_string();
    engines.register(engine).await;
    Collaborators::new(
        Arc::new(StaticAnalyzer::new(sample_pattern())),
        Arc::new(advisor),
        engines,
    )
    .with_recommender(Arc::new(StaticRecommender(Recommendations {
        engines: vec![engine_name],
        storage_class: Some("INTELLIGENT_TIERING".into()),
        cost: Some(CostAnalysis {
            monthly_storage_cost: 1.10,
            transfer_cost: 0.0,
            request_cost: 0.06,
            storage_class: "INTELLIGENT_TIERING".into(),
        }),
    })))
    .with_warnings(Arc::new(StaticWarnings::with_quick_fix(
        "Bundle small files before upload to cut request costs",
    )))
}

//! Data exchanged with the external collaborators.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File/size/domain statistics for a dataset, produced by pattern analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPattern {
    pub source: PathBuf,
    pub total_files: u64,
    pub total_size_bytes: u64,
    /// Files under 1 MiB, the ones bundling helps with.
    pub small_file_count: u64,
    pub largest_file_bytes: u64,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub extensions: BTreeMap<String, u64>,
}

impl DataPattern {
    pub fn average_file_size(&self) -> u64 {
        self.total_size_bytes.checked_div(self.total_files).unwrap_or(0)
    }

    pub fn small_file_ratio(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            self.small_file_count as f64 / self.total_files as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub monthly_storage_cost: f64,
    pub transfer_cost: f64,
    pub request_cost: f64,
    pub storage_class: String,
}

impl CostAnalysis {
    pub fn total(&self) -> f64 {
        self.monthly_storage_cost + self.transfer_cost + self.request_cost
    }
}

/// Ranked tool and tier recommendations for a pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    /// Engine names, best first.
    pub engines: Vec<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub cost: Option<CostAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecommendation {
    pub recommended: bool,
    pub reason: String,
    pub target_bundle_size_bytes: u64,
    pub estimated_bundles: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRequest {
    pub source: PathBuf,
    pub staging_dir: PathBuf,
    pub pattern: DataPattern,
    pub target_bundle_size_bytes: u64,
    #[serde(default)]
    pub compression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleResult {
    pub bundles: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub original_bytes: u64,
    pub bundled_bytes: u64,
    pub estimated_cost_savings: f64,
}

impl BundleResult {
    pub fn compression_ratio(&self) -> f64 {
        if self.bundled_bytes == 0 {
            1.0
        } else {
            self.original_bytes as f64 / self.bundled_bytes as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

/// Output of the warning/diagnostics collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarningReport {
    pub warnings: Vec<Warning>,
    pub quick_fixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: String,
    pub source: PathBuf,
    pub destination: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub id: String,
    pub engine: String,
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub duration_ms: u64,
}

impl TransferResult {
    /// Bytes per second, zero for instantaneous transfers.
    pub fn throughput(&self) -> f64 {
        if self.duration_ms == 0 {
            0.0
        } else {
            self.bytes_transferred as f64 / (self.duration_ms as f64 / 1000.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub id: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_done as f64 / self.bytes_total as f64 * 100.0).min(100.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Wraps an external command-line tool.
    CommandLine,
    /// Talks to the provider through a native client library.
    Sdk,
    /// In-process stand-in.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub upload: bool,
    pub download: bool,
    pub sync: bool,
    pub resumable: bool,
    pub checksums: bool,
    pub max_concurrency: usize,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            upload: true,
            download: true,
            sync: false,
            resumable: false,
            checksums: false,
            max_concurrency: 1,
        }
    }
}

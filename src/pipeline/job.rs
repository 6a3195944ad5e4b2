use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Download,
    Upload,
    Transform,
    Validate,
    Cleanup,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Download,
        JobType::Upload,
        JobType::Transform,
        JobType::Validate,
        JobType::Cleanup,
    ];
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Download => write!(f, "download"),
            JobType::Upload => write!(f, "upload"),
            JobType::Transform => write!(f, "transform"),
            JobType::Validate => write!(f, "validate"),
            JobType::Cleanup => write!(f, "cleanup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A unit of work inside a [`Pipeline`](super::Pipeline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub job_type: JobType,
    pub depends_on: BTreeSet<String>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// 0 to 100.
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            job_type,
            depends_on: BTreeSet::new(),
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            config: serde_json::Map::new(),
            progress: 0,
            result: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_config(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, result: serde_json::Value, retries: u32) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.retry_count = retries;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: String, retries: u32) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.retry_count = retries;
        self.error = Some(error);
    }

    pub(crate) fn mark_skipped(&mut self, reason: String) {
        self.status = JobStatus::Skipped;
        self.finished_at = Some(Utc::now());
        self.error = Some(reason);
    }

    /// Wall-clock runtime in milliseconds, once the job has finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

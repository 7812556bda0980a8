use chrono::{DateTime, Utc};

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Aggregate item counters for a job. Monotonically non-decreasing, and
/// `success + skipped + failed <= total` at every observation.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
    pub total: u64,
    pub bytes_copied: u64,
}

impl JobStats {
    pub fn settled(&self) -> u64 {
        self.success + self.skipped + self.failed
    }
}

/// Persistent descriptor of one long-running job.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub id: String,
    pub task_type: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub stats: JobStats,
    pub principal: String,
    /// Mount ids this job touches, for admin filtering.
    pub mount_scope: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub resumable: bool,
}

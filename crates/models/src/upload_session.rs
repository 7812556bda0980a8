use chrono::{DateTime, Utc};

/// Lifecycle state of a resumable upload session.
///
/// Transitions form a DAG: `active` may update in place or move to any
/// terminal state; terminal states never move again.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadSessionStatus {
    Active,
    Completed,
    Aborted,
    Expired,
    Error,
}

impl UploadSessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadSessionStatus::Active)
    }

    /// Whether a transition from `self` to `next` is allowed. Every state
    /// is reachable from `active`; terminal states never move again.
    pub fn may_become(&self, _next: UploadSessionStatus) -> bool {
        matches!(self, UploadSessionStatus::Active)
    }
}

/// A resumable multipart upload, persisted across client requests.
///
/// A session is `active` iff the underlying provider upload is still usable.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub principal: String,
    pub storage_config_id: String,
    pub mount_id: String,
    pub fs_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub part_size: u64,
    pub total_parts: u32,
    pub bytes_uploaded: u64,
    pub uploaded_parts: u32,
    pub next_expected_range: Option<String>,
    pub provider_upload_id: Option<String>,
    pub provider_upload_url: Option<String>,
    pub provider_meta: serde_json::Value,
    pub status: UploadSessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_dag() {
        use UploadSessionStatus::*;

        for terminal in [Completed, Aborted, Expired, Error] {
            assert!(Active.may_become(terminal));
            assert!(terminal.is_terminal());
            // No retrograde moves out of a terminal state.
            for next in [Active, Completed, Aborted, Expired, Error] {
                assert!(!terminal.may_become(next));
            }
        }
        assert!(Active.may_become(Active)); // Progress updates.
    }
}

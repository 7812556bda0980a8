use chrono::{DateTime, Utc};

/// Parameters for starting a frontend-driven multipart upload.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInit {
    pub file_name: String,
    pub file_size: u64,
    pub part_size: u64,
}

impl MultipartInit {
    /// Number of parts for this plan; the final part may be short.
    pub fn part_count(&self) -> u32 {
        if self.file_size == 0 {
            return 1;
        }
        self.file_size.div_ceil(self.part_size) as u32
    }

    /// Size of part `part_number` (1-based).
    pub fn part_len(&self, part_number: u32) -> u64 {
        let count = self.part_count();
        if part_number < count || self.file_size == 0 {
            self.part_size
        } else {
            self.file_size - self.part_size * u64::from(count - 1)
        }
    }
}

/// One part the client must upload, with its destination URL when the
/// provider hands out per-part URLs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartPlan {
    pub part_number: u32,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInitResult {
    /// Provider upload id; for single-session providers this is the
    /// session upload URL itself.
    pub upload_id: String,
    pub part_size: u64,
    pub part_count: u32,
    pub parts: Vec<PartPlan>,
    /// Opaque provider state persisted on the upload session.
    pub provider_meta: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A part the client reports as uploaded, for completion.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Provider-side state of one uploaded part, for resume.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub part_number: u32,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// An in-progress provider upload under some prefix.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OngoingUpload {
    pub storage_path: String,
    pub upload_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_plan_math() {
        let init = MultipartInit {
            file_name: "f.bin".into(),
            file_size: 8_388_608,
            part_size: 5_242_880,
        };
        assert_eq!(init.part_count(), 2);
        assert_eq!(init.part_len(1), 5_242_880);
        assert_eq!(init.part_len(2), 3_145_728);

        let exact = MultipartInit { file_name: "f".into(), file_size: 10, part_size: 5 };
        assert_eq!(exact.part_count(), 2);
        assert_eq!(exact.part_len(2), 5);

        let empty = MultipartInit { file_name: "f".into(), file_size: 0, part_size: 5 };
        assert_eq!(empty.part_count(), 1);
    }
}

use crate::descriptor::{ByteReader, StreamDescriptor};
use crate::multipart::{
    CompletedPart, MultipartInit, MultipartInitResult, OngoingUpload, PartInfo, PartPlan,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use models::{DirEntry, DriverKind, Error, FileInfo};
use std::collections::HashMap;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

bitflags::bitflags! {
    /// Which parts of the storage contract a driver implements.
    /// Every driver declares at least READER and WRITER.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u16 {
        const READER      = 1 << 0;
        const WRITER      = 1 << 1;
        const ATOMIC      = 1 << 2;
        const PRESIGNED   = 1 << 3;
        const DIRECT_LINK = 1 << 4;
        const MULTIPART   = 1 << 5;
        const PROXY       = 1 << 6;
        const SEARCH      = 1 << 7;
    }
}

/// Per-operation context threaded through every driver call.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub cancel: CancellationToken,
    /// Principal id, for driver-level audit logging only.
    pub principal: Option<String>,
}

impl OpContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, principal: None }
    }

    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A directory listing relative to one driver.
#[derive(Debug, Clone)]
pub struct Listing {
    pub items: Vec<DirEntry>,
    pub is_root: bool,
}

/// Upload payload. Drivers pick the most efficient write path for the
/// variant: buffers go in one shot, known-size streams may stream with a
/// length header, unsized pull-streams are written chunk by chunk.
pub enum UploadBody {
    Buffer(Bytes),
    Stream { reader: ByteReader, size: Option<u64> },
}

impl UploadBody {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        UploadBody::Buffer(bytes.into())
    }

    pub fn size_hint(&self) -> Option<u64> {
        match self {
            UploadBody::Buffer(b) => Some(b.len() as u64),
            UploadBody::Stream { size, .. } => *size,
        }
    }

    /// Drain the body into memory. Only for callers that already know the
    /// payload is small (bounded by protocol limits).
    pub async fn into_bytes(self) -> Result<Bytes, Error> {
        match self {
            UploadBody::Buffer(b) => Ok(b),
            UploadBody::Stream { mut reader, size } => {
                let mut buf = Vec::with_capacity(size.unwrap_or(0) as usize);
                reader.read_to_end(&mut buf).await.map_err(Error::internal)?;
                Ok(buf.into())
            }
        }
    }
}

impl std::fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadBody::Buffer(b) => f.debug_tuple("Buffer").field(&b.len()).finish(),
            UploadBody::Stream { size, .. } => {
                f.debug_struct("Stream").field("size", size).finish()
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub storage_path: String,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDirResult {
    pub already_existed: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameResult {
    pub success: bool,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyResult {
    pub status: CopyStatus,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Copy behavior. The target-existence pre-check always runs unless a
/// caller explicitly disables it; `skip_existing` decides what an existing
/// target means (skip vs overwrite).
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub skip_existing: bool,
    pub precheck: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self { skip_existing: false, precheck: true }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeleteFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchDeleteResult {
    pub successes: u64,
    pub failures: Vec<DeleteFailure>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PresignOptions {
    /// Requested TTL in seconds; drivers clamp to their own limits.
    pub expires_in: Option<u64>,
    pub force_download: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    pub method: String,
    pub storage_path: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    NativeDirect,
    CustomHost,
    Proxy,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedDownload {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: LinkKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The uniform contract implemented by every storage backend.
///
/// Subpaths are canonical, mount-relative, and never contain `..`; drivers
/// still defend their own root. Implementations map every failure into
/// [`models::Error`] and never leak provider error types.
#[async_trait::async_trait]
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    fn capabilities(&self) -> Capability;

    fn has(&self, cap: Capability) -> bool {
        self.capabilities().contains(cap)
    }

    async fn list_directory(&self, subpath: &str, ctx: &OpContext) -> Result<Listing, Error>;

    async fn stat(&self, subpath: &str, ctx: &OpContext) -> Result<FileInfo, Error>;

    async fn exists(&self, subpath: &str, ctx: &OpContext) -> Result<bool, Error> {
        match self.stat(subpath, ctx).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn download(&self, subpath: &str, ctx: &OpContext) -> Result<StreamDescriptor, Error>;

    async fn upload(
        &self,
        subpath: &str,
        body: UploadBody,
        ctx: &OpContext,
    ) -> Result<UploadResult, Error>;

    /// Overwrite semantics; defaults to `upload`.
    async fn update(
        &self,
        subpath: &str,
        body: UploadBody,
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        self.upload(subpath, body, ctx).await
    }

    async fn create_directory(
        &self,
        subpath: &str,
        ctx: &OpContext,
    ) -> Result<CreateDirResult, Error>;

    async fn rename(
        &self,
        old_subpath: &str,
        new_subpath: &str,
        ctx: &OpContext,
    ) -> Result<RenameResult, Error>;

    async fn copy(
        &self,
        src_subpath: &str,
        dst_subpath: &str,
        opts: &CopyOptions,
        ctx: &OpContext,
    ) -> Result<CopyResult, Error>;

    async fn batch_delete(
        &self,
        subpaths: &[String],
        ctx: &OpContext,
    ) -> Result<BatchDeleteResult, Error>;

    async fn search(&self, query: &str, ctx: &OpContext) -> Result<Vec<FileInfo>, Error> {
        let _ = (query, ctx);
        Err(unsupported(self.kind(), "search"))
    }

    async fn presign_upload(
        &self,
        subpath: &str,
        opts: &PresignOptions,
    ) -> Result<PresignedUpload, Error> {
        let _ = (subpath, opts);
        Err(unsupported(self.kind(), "presign_upload"))
    }

    async fn presign_download(
        &self,
        subpath: &str,
        opts: &PresignOptions,
    ) -> Result<PresignedDownload, Error> {
        let _ = (subpath, opts);
        Err(unsupported(self.kind(), "presign_download"))
    }

    // Frontend-driven multipart lifecycle (MULTIPART capability).

    async fn init_multipart(
        &self,
        subpath: &str,
        init: &MultipartInit,
        ctx: &OpContext,
    ) -> Result<MultipartInitResult, Error> {
        let _ = (subpath, init, ctx);
        Err(unsupported(self.kind(), "init_multipart"))
    }

    async fn complete_multipart(
        &self,
        subpath: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        let _ = (subpath, upload_id, parts, ctx);
        Err(unsupported(self.kind(), "complete_multipart"))
    }

    async fn abort_multipart(
        &self,
        subpath: &str,
        upload_id: &str,
        ctx: &OpContext,
    ) -> Result<(), Error> {
        let _ = (subpath, upload_id, ctx);
        Err(unsupported(self.kind(), "abort_multipart"))
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
        ctx: &OpContext,
    ) -> Result<Vec<OngoingUpload>, Error> {
        let _ = (prefix, ctx);
        Err(unsupported(self.kind(), "list_multipart_uploads"))
    }

    /// `part_size` is the part size agreed at init, persisted on the upload
    /// session; providers that report raw byte progress rather than parts
    /// (Graph) need it to derive the completed-part count.
    async fn list_parts(
        &self,
        subpath: &str,
        upload_id: &str,
        part_size: u64,
        ctx: &OpContext,
    ) -> Result<Vec<PartInfo>, Error> {
        let _ = (subpath, upload_id, part_size, ctx);
        Err(unsupported(self.kind(), "list_parts"))
    }

    async fn refresh_part_urls(
        &self,
        subpath: &str,
        upload_id: &str,
        part_numbers: &[u32],
        ctx: &OpContext,
    ) -> Result<Vec<PartPlan>, Error> {
        let _ = (subpath, upload_id, part_numbers, ctx);
        Err(unsupported(self.kind(), "refresh_part_urls"))
    }
}

pub(crate) fn unsupported(kind: DriverKind, op: &str) -> Error {
    Error::Validation(format!("{kind} driver does not support {op}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_driver_reads_and_writes() {
        // The invariant is enforced by construction: each driver's
        // capability constant includes READER | WRITER.
        for caps in [
            crate::LocalDriver::CAPABILITIES,
            crate::S3Driver::CAPABILITIES,
            crate::WebdavDriver::CAPABILITIES,
            crate::GraphDriver::CAPABILITIES,
        ] {
            assert!(caps.contains(Capability::READER | Capability::WRITER));
        }
    }

    #[tokio::test]
    async fn test_body_size_hints() {
        let buffer = UploadBody::from_bytes(&b"abc"[..]);
        assert_eq!(buffer.size_hint(), Some(3));

        let pull = UploadBody::Stream { reader: Box::pin(&b"abcd"[..]), size: None };
        assert_eq!(pull.size_hint(), None);
        assert_eq!(pull.into_bytes().await.unwrap().as_ref(), b"abcd");
    }
}

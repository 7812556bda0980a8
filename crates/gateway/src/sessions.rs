use crate::fs::FileSystem;
use crate::store::{SessionPatch, UploadSessionStore};
use chrono::{Duration, Utc};
use models::{Error, Principal, UploadSession, UploadSessionStatus};
use std::sync::Arc;
use storage::{
    Capability, CompletedPart, MultipartInit, MultipartInitResult, OpContext, PartInfo, PartPlan,
    UploadResult,
};

/// Sessions with no provider expiry fall back to this lifetime.
const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// A freshly initialized resumable upload.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInit {
    pub session_id: String,
    #[serde(flatten)]
    pub init: MultipartInitResult,
}

/// Drives the resumable multipart lifecycle, persisting an UploadSession
/// row through every transition of its status DAG.
pub struct UploadSessionService {
    fs: Arc<FileSystem>,
    store: Arc<dyn UploadSessionStore>,
}

impl UploadSessionService {
    pub fn new(fs: Arc<FileSystem>, store: Arc<dyn UploadSessionStore>) -> Self {
        Self { fs, store }
    }

    async fn owned_session(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<UploadSession, Error> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(Error::UploadSessionNotFound)?;
        if !principal.is_admin() && session.principal != principal.id() {
            return Err(Error::UploadSessionNotFound);
        }
        Ok(session)
    }

    #[tracing::instrument(skip(self, principal, ctx), fields(principal = %principal.id()))]
    pub async fn init(
        &self,
        principal: &Principal,
        path: &str,
        init: MultipartInit,
        ctx: &OpContext,
    ) -> Result<SessionInit, Error> {
        if init.part_size == 0 {
            return Err(Error::Validation("partSize must be positive".to_string()));
        }
        if init.file_name.is_empty() {
            return Err(Error::Validation("fileName must not be empty".to_string()));
        }

        let target = self.fs.resolve_for(principal, path).await?;
        if !target.driver.has(Capability::MULTIPART) {
            return Err(Error::Validation(format!(
                "{} driver does not support multipart uploads",
                target.driver.kind()
            )));
        }

        let result = target.driver.init_multipart(&target.subpath, &init, ctx).await?;
        let now = Utc::now();
        let session = UploadSession {
            id: models::new_id(),
            principal: principal.id().to_string(),
            storage_config_id: target.config.id.clone(),
            mount_id: target.mount.id.clone(),
            fs_path: format!(
                "{}/{}",
                target.mount.mount_path.trim_end_matches('/'),
                target.subpath
            ),
            file_name: init.file_name.clone(),
            file_size: init.file_size,
            part_size: init.part_size,
            total_parts: result.part_count,
            bytes_uploaded: 0,
            uploaded_parts: 0,
            next_expected_range: Some(format!("0-{}", init.file_size.saturating_sub(1))),
            provider_upload_id: Some(result.upload_id.clone()),
            provider_upload_url: result
                .provider_meta
                .get("uploadUrl")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            provider_meta: result.provider_meta.clone(),
            status: UploadSessionStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: Some(
                result.expires_at.unwrap_or(now + Duration::hours(DEFAULT_SESSION_TTL_HOURS)),
            ),
        };
        self.store.insert_session(session.clone()).await?;
        Ok(SessionInit { session_id: session.id, init: result })
    }

    pub async fn complete(
        &self,
        principal: &Principal,
        session_id: &str,
        parts: &[CompletedPart],
        ctx: &OpContext,
    ) -> Result<UploadResult, Error> {
        let session = self.owned_session(principal, session_id).await?;
        if session.status != UploadSessionStatus::Active {
            return Err(Error::Conflict(format!(
                "upload session {session_id} is {:?}",
                session.status
            )));
        }
        let (driver, subpath) = self.fs.target_for_session(&session).await?;
        let upload_id =
            session.provider_upload_id.as_deref().ok_or(Error::UploadSessionNotFound)?;

        let result = driver.complete_multipart(&subpath, upload_id, parts, ctx).await?;
        self.store
            .update_session_if_active(
                session_id,
                SessionPatch {
                    status: Some(UploadSessionStatus::Completed),
                    bytes_uploaded: Some(session.file_size),
                    uploaded_parts: Some(session.total_parts),
                    next_expected_range: Some(None),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;
        Ok(result)
    }

    pub async fn abort(
        &self,
        principal: &Principal,
        session_id: &str,
        ctx: &OpContext,
    ) -> Result<(), Error> {
        let session = self.owned_session(principal, session_id).await?;
        if session.status != UploadSessionStatus::Active {
            return Err(Error::Conflict(format!(
                "upload session {session_id} is {:?}",
                session.status
            )));
        }
        let (driver, subpath) = self.fs.target_for_session(&session).await?;
        if let Some(upload_id) = session.provider_upload_id.as_deref() {
            // The provider may already have discarded the upload.
            match driver.abort_multipart(&subpath, upload_id, ctx).await {
                Ok(()) | Err(Error::UploadSessionNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        self.store
            .update_session_if_active(
                session_id,
                SessionPatch {
                    status: Some(UploadSessionStatus::Aborted),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    /// Provider-side progress for resume. A session whose provider upload
    /// vanished (404 probe) is marked `error` so the caller restarts.
    pub async fn list_parts(
        &self,
        principal: &Principal,
        session_id: &str,
        ctx: &OpContext,
    ) -> Result<Vec<PartInfo>, Error> {
        let session = self.owned_session(principal, session_id).await?;
        let (driver, subpath) = self.fs.target_for_session(&session).await?;
        let upload_id =
            session.provider_upload_id.as_deref().ok_or(Error::UploadSessionNotFound)?;

        match driver.list_parts(&subpath, upload_id, session.part_size, ctx).await {
            Ok(parts) => Ok(parts),
            Err(Error::UploadSessionNotFound) => {
                let _ = self
                    .store
                    .update_session_if_active(
                        session_id,
                        SessionPatch {
                            status: Some(UploadSessionStatus::Error),
                            ..Default::default()
                        },
                        Utc::now(),
                    )
                    .await;
                Err(Error::UploadSessionNotFound)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn refresh_urls(
        &self,
        principal: &Principal,
        session_id: &str,
        part_numbers: &[u32],
        ctx: &OpContext,
    ) -> Result<Vec<PartPlan>, Error> {
        let session = self.owned_session(principal, session_id).await?;
        if session.status != UploadSessionStatus::Active {
            return Err(Error::Conflict(format!(
                "upload session {session_id} is {:?}",
                session.status
            )));
        }
        let (driver, subpath) = self.fs.target_for_session(&session).await?;
        let upload_id =
            session.provider_upload_id.as_deref().ok_or(Error::UploadSessionNotFound)?;
        driver.refresh_part_urls(&subpath, upload_id, part_numbers, ctx).await
    }

    /// Client-reported progress; the CAS rejects updates racing an abort.
    pub async fn record_progress(
        &self,
        principal: &Principal,
        session_id: &str,
        bytes_uploaded: u64,
        uploaded_parts: u32,
        next_expected_range: Option<String>,
    ) -> Result<UploadSession, Error> {
        let session = self.owned_session(principal, session_id).await?;
        self.store
            .update_session_if_active(
                &session.id,
                SessionPatch {
                    bytes_uploaded: Some(bytes_uploaded),
                    uploaded_parts: Some(uploaded_parts),
                    next_expected_range: Some(next_expected_range),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
    }

    pub async fn get(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<UploadSession, Error> {
        self.owned_session(principal, session_id).await
    }
}

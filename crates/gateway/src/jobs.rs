use crate::fs::FileSystem;
use crate::store::{JobFilter, JobStore};
use chrono::Utc;
use models::{Error, JobDescriptor, JobStats, JobStatus, Principal};
use std::collections::HashMap;
use std::sync::Arc;
use storage::{CopyOptions, CopyStatus, OpContext};
use tokio_util::sync::CancellationToken;

pub const TASK_TYPE_COPY: &str = "copy";

const DEFAULT_CONCURRENCY: usize = 10;
const MAX_CONCURRENCY: usize = 32;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyItem {
    pub source_path: String,
    pub target_path: String,
    /// Per-item override of the job-level flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_existing: Option<bool>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyJobOptions {
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CopyPayload {
    pub items: Vec<CopyItem>,
    #[serde(default)]
    pub options: CopyJobOptions,
}

/// How a batch-copy request was answered.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum BatchCopyOutcome {
    /// Same-mount atomic copies, answered synchronously.
    Completed { results: Vec<storage::CopyResult> },
    /// Cross-storage work went to the job engine.
    Enqueued { job_id: String },
}

/// A long-running task type. `copy` is built in; the registry exists so
/// more types can be added without touching the engine.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    fn task_type(&self) -> &'static str;

    /// Validate a payload at enqueue time.
    fn validate(&self, payload: &serde_json::Value) -> Result<u64, Error>;

    /// Process the job's items, recording per-item outcomes through the
    /// store. Returning an error marks the whole job failed; per-item
    /// failures must be absorbed into stats instead.
    async fn run(
        &self,
        job: &JobDescriptor,
        principal: &Principal,
        store: &Arc<dyn JobStore>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>;
}

/// Descriptor persistence plus a bounded worker pool per job.
pub struct JobEngine {
    store: Arc<dyn JobStore>,
    fs: Arc<FileSystem>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    running: std::sync::Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl JobEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        fs: Arc<FileSystem>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let mut engine = Self {
            store,
            fs: fs.clone(),
            handlers: HashMap::new(),
            running: std::sync::Mutex::new(HashMap::new()),
            shutdown,
        };
        engine.register(Arc::new(CopyHandler { fs }));
        Arc::new(engine)
    }

    /// Register a handler; a duplicate task type is a programming error.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let task_type = handler.task_type();
        if self.handlers.insert(task_type, handler).is_some() {
            panic!("a JobHandler for {task_type:?} is already registered");
        }
    }

    #[tracing::instrument(skip(self, payload, principal))]
    pub async fn create_job(
        self: &Arc<Self>,
        task_type: &str,
        payload: serde_json::Value,
        principal: Principal,
    ) -> Result<JobDescriptor, Error> {
        let handler = self
            .handlers
            .get(task_type)
            .ok_or_else(|| Error::Validation(format!("unknown task type {task_type:?}")))?
            .clone();
        let total = handler.validate(&payload)?;

        let now = Utc::now();
        let job = JobDescriptor {
            id: models::new_id(),
            task_type: task_type.to_string(),
            status: JobStatus::Pending,
            payload,
            stats: JobStats { total, ..Default::default() },
            principal: principal.id().to_string(),
            mount_scope: Vec::new(),
            created_at: now,
            updated_at: now,
            error: None,
            resumable: false,
        };
        self.store.insert_job(job.clone()).await?;

        let cancel = self.shutdown.child_token();
        self.running.lock().expect("running map lock").insert(job.id.clone(), cancel.clone());

        let engine = self.clone();
        let spawned = job.clone();
        tokio::spawn(async move {
            engine.run_job(spawned, principal, handler, cancel).await;
        });
        Ok(job)
    }

    async fn run_job(
        self: Arc<Self>,
        job: JobDescriptor,
        principal: Principal,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) {
        let id = job.id.clone();
        if let Err(err) =
            self.store.set_job_status(&id, JobStatus::Running, None, Utc::now()).await
        {
            tracing::error!(job = %id, ?err, "failed to mark job running");
            return;
        }

        let run = handler.run(&job, &principal, &self.store, &cancel).await;

        let stats = match self.store.get_job(&id).await {
            Ok(Some(job)) => job.stats,
            _ => JobStats::default(),
        };
        let (status, error) = if cancel.is_cancelled() {
            (JobStatus::Cancelled, None)
        } else {
            match run {
                Err(err) => (JobStatus::Failed, Some(err.to_string())),
                Ok(()) if stats.failed > 0 && stats.success + stats.skipped == 0 => {
                    (JobStatus::Failed, Some(format!("{} items failed", stats.failed)))
                }
                Ok(()) if stats.failed > 0 => {
                    (JobStatus::Succeeded, Some(format!("{} items failed", stats.failed)))
                }
                Ok(()) => (JobStatus::Succeeded, None),
            }
        };

        if let Err(err) = self.store.set_job_status(&id, status, error, Utc::now()).await {
            tracing::error!(job = %id, ?err, "failed to persist job outcome");
        }
        self.running.lock().expect("running map lock").remove(&id);
        tracing::info!(job = %id, ?status, ?stats, "job finished");
    }

    fn authorize<'j>(
        principal: &Principal,
        job: Option<&'j JobDescriptor>,
        id: &str,
    ) -> Result<&'j JobDescriptor, Error> {
        let job = job.ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if !principal.is_admin() && job.principal != principal.id() {
            // Hide other principals' jobs entirely.
            return Err(Error::NotFound(format!("job {id}")));
        }
        Ok(job)
    }

    pub async fn get_job(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<JobDescriptor, Error> {
        let job = self.store.get_job(id).await?;
        Ok(Self::authorize(principal, job.as_ref(), id)?.clone())
    }

    pub async fn list_jobs(
        &self,
        principal: &Principal,
        mut filter: JobFilter,
    ) -> Result<Vec<JobDescriptor>, Error> {
        if !principal.is_admin() {
            filter.principal = Some(principal.id().to_string());
        }
        self.store.list_jobs(&filter).await
    }

    /// Flip the descriptor to cancelled and signal in-flight workers, which
    /// check between items and propagate into open streams.
    pub async fn cancel_job(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<JobDescriptor, Error> {
        let job = self.store.get_job(id).await?;
        let job = Self::authorize(principal, job.as_ref(), id)?.clone();
        if job.status.is_terminal() {
            return Err(Error::Conflict(format!("job {id} already {:?}", job.status)));
        }

        if let Some(token) = self.running.lock().expect("running map lock").get(id) {
            token.cancel();
        }
        self.store.set_job_status(id, JobStatus::Cancelled, None, Utc::now()).await?;
        self.get_job(principal, id).await
    }

    pub async fn delete_job(&self, principal: &Principal, id: &str) -> Result<(), Error> {
        let job = self.store.get_job(id).await?;
        let job = Self::authorize(principal, job.as_ref(), id)?;
        if !job.status.is_terminal() {
            return Err(Error::Conflict(format!("job {id} is still {:?}", job.status)));
        }
        self.store.delete_job(id).await?;
        Ok(())
    }

    /// Answer a batch-copy request: same-mount atomic pairs synchronously,
    /// anything crossing storage through a job.
    pub async fn batch_copy(
        self: &Arc<Self>,
        principal: &Principal,
        items: Vec<CopyItem>,
        options: CopyJobOptions,
        ctx: &OpContext,
    ) -> Result<BatchCopyOutcome, Error> {
        if items.is_empty() {
            return Err(Error::Validation("items must not be empty".to_string()));
        }

        let mut all_direct = true;
        for item in &items {
            match self.fs.same_mount(principal, &item.source_path, &item.target_path).await {
                Ok(true) => {}
                _ => {
                    all_direct = false;
                    break;
                }
            }
        }

        if all_direct {
            let mut results = Vec::with_capacity(items.len());
            for item in &items {
                let opts = CopyOptions {
                    skip_existing: item.skip_existing.unwrap_or(options.skip_existing),
                    precheck: true,
                };
                let copied = self
                    .fs
                    .copy_item(principal, &item.source_path, &item.target_path, &opts, ctx)
                    .await?;
                results.push(storage::CopyResult {
                    status: copied.status,
                    source: item.source_path.clone(),
                    target: item.target_path.clone(),
                    reason: copied.reason,
                });
            }
            return Ok(BatchCopyOutcome::Completed { results });
        }

        let payload = serde_json::to_value(CopyPayload { items, options })
            .map_err(Error::internal)?;
        let job = self.create_job(TASK_TYPE_COPY, payload, principal.clone()).await?;
        Ok(BatchCopyOutcome::Enqueued { job_id: job.id })
    }
}

/// The built-in `copy` handler: fans items out to a bounded worker pool
/// sharing one cancellation token.
struct CopyHandler {
    fs: Arc<FileSystem>,
}

impl CopyHandler {
    /// Fatal errors abort the whole job instead of recording one failure.
    fn is_fatal(err: &Error) -> bool {
        matches!(err, Error::DriverUnsupportedEnv(_) | Error::DriverReadonly)
    }
}

#[async_trait::async_trait]
impl JobHandler for CopyHandler {
    fn task_type(&self) -> &'static str {
        TASK_TYPE_COPY
    }

    fn validate(&self, payload: &serde_json::Value) -> Result<u64, Error> {
        let payload: CopyPayload = serde_json::from_value(payload.clone())
            .map_err(|err| Error::Validation(format!("invalid copy payload: {err}")))?;
        if payload.items.is_empty() {
            return Err(Error::Validation("items must not be empty".to_string()));
        }
        Ok(payload.items.len() as u64)
    }

    async fn run(
        &self,
        job: &JobDescriptor,
        principal: &Principal,
        store: &Arc<dyn JobStore>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let payload: CopyPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| Error::Validation(format!("invalid copy payload: {err}")))?;
        let concurrency = payload
            .options
            .max_concurrency
            .unwrap_or(DEFAULT_CONCURRENCY)
            .clamp(1, MAX_CONCURRENCY);

        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut tasks = tokio::task::JoinSet::new();
        let fatal: Arc<std::sync::Mutex<Option<Error>>> =
            Arc::new(std::sync::Mutex::new(None));

        for item in payload.items {
            // Cancellation is checked at every item boundary.
            if cancel.is_cancelled() {
                break;
            }
            if fatal.lock().expect("fatal flag lock").is_some() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(Error::internal)?;

            let fs = self.fs.clone();
            let store = store.clone();
            let principal = principal.clone();
            let job_id = job.id.clone();
            let skip_existing =
                item.skip_existing.unwrap_or(payload.options.skip_existing);
            let cancel = cancel.clone();
            let fatal = fatal.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let ctx = OpContext { cancel: cancel.clone(), principal: Some(principal.id().to_string()) };
                let opts = CopyOptions { skip_existing, precheck: true };

                let mut delta = JobStats::default();
                match fs
                    .copy_item(&principal, &item.source_path, &item.target_path, &opts, &ctx)
                    .await
                {
                    Ok(copied) => match copied.status {
                        CopyStatus::Success => {
                            delta.success = 1;
                            delta.bytes_copied = copied.bytes;
                        }
                        CopyStatus::Skipped => delta.skipped = 1,
                        CopyStatus::Failed => {
                            delta.failed = 1;
                            tracing::warn!(
                                source = %item.source_path,
                                target = %item.target_path,
                                reason = ?copied.reason,
                                "copy item failed"
                            );
                        }
                    },
                    Err(Error::Cancelled) => return,
                    Err(err) if CopyHandler::is_fatal(&err) => {
                        *fatal.lock().expect("fatal flag lock") = Some(err);
                        return;
                    }
                    Err(err) => {
                        delta.failed = 1;
                        tracing::warn!(
                            source = %item.source_path,
                            target = %item.target_path,
                            ?err,
                            "copy item errored"
                        );
                    }
                }
                // Outcomes land in completion order.
                if let Err(err) = store.add_job_stats(&job_id, delta, Utc::now()).await {
                    tracing::error!(job = %job_id, ?err, "failed to record item outcome");
                }
            });
        }

        while tasks.join_next().await.is_some() {}

        if let Some(err) = fatal.lock().expect("fatal flag lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use models::{DriverKind, Mount, StorageConfig, WebdavPolicy};
    use storage::UploadBody;

    async fn fixture() -> (Arc<JobEngine>, Arc<FileSystem>, tempfile::TempDir, tempfile::TempDir)
    {
        let store = MemoryStore::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        for (i, dir) in [&dir_a, &dir_b].into_iter().enumerate() {
            store
                .put_storage_config(StorageConfig {
                    id: format!("s{i}"),
                    kind: DriverKind::Local,
                    config: serde_json::json!({ "rootPath": dir.path().to_string_lossy() }),
                    is_public: true,
                    is_default: i == 0,
                    owner_id: "admin".into(),
                })
                .await;
            store
                .put_mount(Mount {
                    id: format!("m{i}"),
                    mount_path: format!("/m{i}"),
                    storage_config_id: format!("s{i}"),
                    cache_ttl: 0,
                    web_proxy: false,
                    webdav_policy: WebdavPolicy::Redirect,
                    owner: "admin".into(),
                    sign_secret: "sec".into(),
                    created_at: Utc::now(),
                    last_used_at: None,
                })
                .await;
        }

        let fs = Arc::new(FileSystem::new(store.clone()));
        let engine = JobEngine::new(store, fs.clone(), CancellationToken::new());
        (engine, fs, dir_a, dir_b)
    }

    fn admin() -> Principal {
        Principal::Admin { id: "root".into() }
    }

    async fn wait_terminal(engine: &Arc<JobEngine>, id: &str) -> JobDescriptor {
        for _ in 0..200 {
            let job = engine.get_job(&admin(), id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job {id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_cross_mount_copy_job_succeeds_then_skips() {
        let (engine, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        fs.write(&admin(), "/m0/x.bin", UploadBody::from_bytes(&b"payload"[..]), true, &ctx)
            .await
            .unwrap();

        let payload = serde_json::json!({
            "items": [{ "sourcePath": "/m0/x.bin", "targetPath": "/m1/x.bin" }],
            "options": { "skipExisting": true, "maxConcurrency": 4 },
        });
        let job = engine
            .create_job(TASK_TYPE_COPY, payload.clone(), admin())
            .await
            .unwrap();
        let done = wait_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.stats.success, 1);
        assert_eq!(done.stats.total, 1);
        assert_eq!(done.stats.bytes_copied, 7);

        // The identical job again: the item is skipped, not rewritten.
        let job = engine.create_job(TASK_TYPE_COPY, payload, admin()).await.unwrap();
        let done = wait_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.stats.skipped, 1);
        assert_eq!(done.stats.success, 0);
    }

    #[tokio::test]
    async fn test_missing_source_records_failure() {
        let (engine, _fs, _a, _b) = fixture().await;
        let payload = serde_json::json!({
            "items": [{ "sourcePath": "/m0/ghost.bin", "targetPath": "/m1/ghost.bin" }],
        });
        let job = engine.create_job(TASK_TYPE_COPY, payload, admin()).await.unwrap();
        let done = wait_terminal(&engine, &job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.stats.failed, 1);
        assert!(done.error.is_some());
    }

    #[tokio::test]
    async fn test_stats_bounded_by_total() {
        let (engine, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        for name in ["a", "b", "c"] {
            fs.write(
                &admin(),
                &format!("/m0/{name}.txt"),
                UploadBody::from_bytes(&b"x"[..]),
                true,
                &ctx,
            )
            .await
            .unwrap();
        }

        let payload = serde_json::json!({
            "items": [
                { "sourcePath": "/m0/a.txt", "targetPath": "/m1/a.txt" },
                { "sourcePath": "/m0/b.txt", "targetPath": "/m1/b.txt" },
                { "sourcePath": "/m0/missing.txt", "targetPath": "/m1/c.txt" },
            ],
        });
        let job = engine.create_job(TASK_TYPE_COPY, payload, admin()).await.unwrap();
        let done = wait_terminal(&engine, &job.id).await;
        assert_eq!(done.stats.total, 3);
        assert_eq!(done.stats.settled(), 3);
        assert_eq!(done.stats.success, 2);
        assert_eq!(done.stats.failed, 1);
        // Partial failure with successes still counts as succeeded.
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.error.as_deref(), Some("1 items failed"));
    }

    #[tokio::test]
    async fn test_unknown_task_type_rejected() {
        let (engine, _fs, _a, _b) = fixture().await;
        let err = engine
            .create_job("transcode", serde_json::json!({}), admin())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_principal_isolation() {
        let (engine, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        fs.write(&admin(), "/m0/f.txt", UploadBody::from_bytes(&b"x"[..]), true, &ctx)
            .await
            .unwrap();

        let payload = serde_json::json!({
            "items": [{ "sourcePath": "/m0/f.txt", "targetPath": "/m1/f.txt" }],
        });
        let job = engine.create_job(TASK_TYPE_COPY, payload, admin()).await.unwrap();
        wait_terminal(&engine, &job.id).await;

        let stranger = Principal::ApiKey {
            id: "key".into(),
            basic_path: "/".into(),
            storage_config_ids: Default::default(),
        };
        // Foreign jobs are invisible, not forbidden.
        let err = engine.get_job(&stranger, &job.id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(engine.list_jobs(&stranger, JobFilter::default()).await.unwrap().is_empty());
        assert_eq!(engine.list_jobs(&admin(), JobFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_requires_terminal() {
        let (engine, fs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        fs.write(&admin(), "/m0/f.txt", UploadBody::from_bytes(&b"x"[..]), true, &ctx)
            .await
            .unwrap();
        let payload = serde_json::json!({
            "items": [{ "sourcePath": "/m0/f.txt", "targetPath": "/m1/f.txt" }],
        });
        let job = engine.create_job(TASK_TYPE_COPY, payload, admin()).await.unwrap();
        wait_terminal(&engine, &job.id).await;
        engine.delete_job(&admin(), &job.id).await.unwrap();
        let err = engine.get_job(&admin(), &job.id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}

//! Repository interfaces for the relational store, plus the in-memory
//! implementation backing tests and the default server.
//!
//! The store itself is an external collaborator; these traits carry the
//! compare-and-set semantics the rest of the system relies on (upload
//! session progress CAS, scheduled-job lease CAS), so any implementation
//! must provide them atomically.

use chrono::{DateTime, Utc};
use models::{
    Error, JobDescriptor, JobStats, JobStatus, Mount, PathPassword, RunStatus, ScheduledJob,
    ScheduledJobRun, StorageConfig, UploadSession, UploadSessionStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait MountStore: Send + Sync {
    async fn list_mounts(&self) -> Result<Vec<Mount>, Error>;
    async fn get_mount(&self, id: &str) -> Result<Option<Mount>, Error>;
    async fn get_storage_config(&self, id: &str) -> Result<Option<StorageConfig>, Error>;
    async fn touch_mount(&self, id: &str, at: DateTime<Utc>) -> Result<(), Error>;
    async fn path_password(&self, path: &str) -> Result<Option<PathPassword>, Error>;
}

/// Typed patch for one upload-session progress update.
#[derive(Debug, Default, Clone)]
pub struct SessionPatch {
    pub status: Option<UploadSessionStatus>,
    pub bytes_uploaded: Option<u64>,
    pub uploaded_parts: Option<u32>,
    pub next_expected_range: Option<Option<String>>,
    pub provider_meta: Option<serde_json::Value>,
}

#[async_trait::async_trait]
pub trait UploadSessionStore: Send + Sync {
    async fn insert_session(&self, session: UploadSession) -> Result<(), Error>;
    async fn get_session(&self, id: &str) -> Result<Option<UploadSession>, Error>;
    async fn list_sessions(&self) -> Result<Vec<UploadSession>, Error>;

    /// Apply `patch` iff the session exists and is still `active`: the
    /// compare half of the CAS guards against racing aborts and expiry.
    /// A transition out of `active` must respect the status DAG.
    async fn update_session_if_active(
        &self,
        id: &str,
        patch: SessionPatch,
        at: DateTime<Utc>,
    ) -> Result<UploadSession, Error>;

    async fn delete_session(&self, id: &str) -> Result<bool, Error>;
}

#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub task_type: Option<String>,
    pub status: Option<JobStatus>,
    pub principal: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: JobDescriptor) -> Result<(), Error>;
    async fn get_job(&self, id: &str) -> Result<Option<JobDescriptor>, Error>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobDescriptor>, Error>;
    async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Atomically add per-item outcome counters; returns the new stats.
    /// Counters only grow, preserving monotonic progress.
    async fn add_job_stats(
        &self,
        id: &str,
        delta: JobStats,
        at: DateTime<Utc>,
    ) -> Result<JobStats, Error>;

    async fn delete_job(&self, id: &str) -> Result<bool, Error>;
}

/// Outcome applied to a scheduled job after a run finishes.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub next_run_after: Option<DateTime<Utc>>,
    /// Set when an invalid schedule disables the job.
    pub schedule_error: Option<String>,
}

#[async_trait::async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn upsert_scheduled_job(&self, job: ScheduledJob) -> Result<(), Error>;
    async fn get_scheduled_job(&self, task_id: &str) -> Result<Option<ScheduledJob>, Error>;
    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, Error>;
    async fn delete_scheduled_job(&self, task_id: &str) -> Result<bool, Error>;

    /// Lease CAS: set `lock_until := until` iff the job is enabled, its
    /// stored `lock_until` equals `observed` (treating anything `<= now` as
    /// stale-equal), and no other writer got there first. Returns the job
    /// on a win, `None` when the lease was lost.
    async fn try_acquire_lease(
        &self,
        task_id: &str,
        observed: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>, Error>;

    /// Persist a finished run: counters, last-run fields, next fire time,
    /// and lease release, in one atomic step.
    async fn finish_run(&self, task_id: &str, outcome: RunOutcome) -> Result<(), Error>;

    async fn record_run(&self, run: ScheduledJobRun) -> Result<(), Error>;
    async fn list_runs(&self, task_id: &str, limit: usize) -> Result<Vec<ScheduledJobRun>, Error>;
    async fn list_runs_since(&self, since: DateTime<Utc>) -> Result<Vec<ScheduledJobRun>, Error>;
}

#[derive(Default)]
struct Inner {
    mounts: BTreeMap<String, Mount>,
    configs: BTreeMap<String, StorageConfig>,
    path_passwords: BTreeMap<String, PathPassword>,
    sessions: BTreeMap<String, UploadSession>,
    jobs: BTreeMap<String, JobDescriptor>,
    scheduled: BTreeMap<String, ScheduledJob>,
    runs: Vec<ScheduledJobRun>,
}

/// In-memory store. One lock guards all tables, which makes every CAS in
/// the trait contracts trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_mount(&self, mount: Mount) {
        self.inner.write().await.mounts.insert(mount.id.clone(), mount);
    }

    pub async fn put_storage_config(&self, config: StorageConfig) {
        self.inner.write().await.configs.insert(config.id.clone(), config);
    }

    pub async fn put_path_password(&self, password: PathPassword) {
        self.inner.write().await.path_passwords.insert(password.path.clone(), password);
    }
}

#[async_trait::async_trait]
impl MountStore for MemoryStore {
    async fn list_mounts(&self) -> Result<Vec<Mount>, Error> {
        Ok(self.inner.read().await.mounts.values().cloned().collect())
    }

    async fn get_mount(&self, id: &str) -> Result<Option<Mount>, Error> {
        Ok(self.inner.read().await.mounts.get(id).cloned())
    }

    async fn get_storage_config(&self, id: &str) -> Result<Option<StorageConfig>, Error> {
        Ok(self.inner.read().await.configs.get(id).cloned())
    }

    async fn touch_mount(&self, id: &str, at: DateTime<Utc>) -> Result<(), Error> {
        if let Some(mount) = self.inner.write().await.mounts.get_mut(id) {
            mount.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn path_password(&self, path: &str) -> Result<Option<PathPassword>, Error> {
        Ok(self.inner.read().await.path_passwords.get(path).cloned())
    }
}

#[async_trait::async_trait]
impl UploadSessionStore for MemoryStore {
    async fn insert_session(&self, session: UploadSession) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.id) {
            return Err(Error::Conflict(format!("upload session {} exists", session.id)));
        }
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<UploadSession>, Error> {
        Ok(self.inner.read().await.sessions.get(id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<UploadSession>, Error> {
        Ok(self.inner.read().await.sessions.values().cloned().collect())
    }

    async fn update_session_if_active(
        &self,
        id: &str,
        patch: SessionPatch,
        at: DateTime<Utc>,
    ) -> Result<UploadSession, Error> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(id).ok_or(Error::UploadSessionNotFound)?;
        if session.status != UploadSessionStatus::Active {
            return Err(Error::Conflict(format!(
                "upload session {id} is no longer active"
            )));
        }
        if let Some(status) = patch.status {
            if !session.status.may_become(status) {
                return Err(Error::Conflict(format!(
                    "upload session {id} cannot transition"
                )));
            }
            session.status = status;
        }
        if let Some(bytes) = patch.bytes_uploaded {
            session.bytes_uploaded = bytes;
        }
        if let Some(parts) = patch.uploaded_parts {
            session.uploaded_parts = parts;
        }
        if let Some(range) = patch.next_expected_range {
            session.next_expected_range = range;
        }
        if let Some(meta) = patch.provider_meta {
            session.provider_meta = meta;
        }
        session.updated_at = at;
        Ok(session.clone())
    }

    async fn delete_session(&self, id: &str) -> Result<bool, Error> {
        Ok(self.inner.write().await.sessions.remove(id).is_some())
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: JobDescriptor) -> Result<(), Error> {
        self.inner.write().await.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobDescriptor>, Error> {
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobDescriptor>, Error> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|job| {
                filter.task_type.as_deref().is_none_or(|t| job.task_type == t)
                    && filter.status.is_none_or(|s| job.status == s)
                    && filter.principal.as_deref().is_none_or(|p| job.principal == p)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        job.status = status;
        if error.is_some() {
            job.error = error;
        }
        job.updated_at = at;
        Ok(())
    }

    async fn add_job_stats(
        &self,
        id: &str,
        delta: JobStats,
        at: DateTime<Utc>,
    ) -> Result<JobStats, Error> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        job.stats.success += delta.success;
        job.stats.skipped += delta.skipped;
        job.stats.failed += delta.failed;
        job.stats.bytes_copied += delta.bytes_copied;
        job.updated_at = at;
        Ok(job.stats)
    }

    async fn delete_job(&self, id: &str) -> Result<bool, Error> {
        Ok(self.inner.write().await.jobs.remove(id).is_some())
    }
}

#[async_trait::async_trait]
impl ScheduleStore for MemoryStore {
    async fn upsert_scheduled_job(&self, job: ScheduledJob) -> Result<(), Error> {
        self.inner.write().await.scheduled.insert(job.task_id.clone(), job);
        Ok(())
    }

    async fn get_scheduled_job(&self, task_id: &str) -> Result<Option<ScheduledJob>, Error> {
        Ok(self.inner.read().await.scheduled.get(task_id).cloned())
    }

    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>, Error> {
        Ok(self.inner.read().await.scheduled.values().cloned().collect())
    }

    async fn delete_scheduled_job(&self, task_id: &str) -> Result<bool, Error> {
        Ok(self.inner.write().await.scheduled.remove(task_id).is_some())
    }

    async fn try_acquire_lease(
        &self,
        task_id: &str,
        observed: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledJob>, Error> {
        let mut inner = self.inner.write().await;
        let Some(job) = inner.scheduled.get_mut(task_id) else {
            return Ok(None);
        };
        if !job.enabled {
            return Ok(None);
        }
        // The stored lease must still be what the caller observed, and that
        // observation must be stale; a fresh lock means someone else runs.
        if job.lock_until != observed {
            return Ok(None);
        }
        if matches!(job.lock_until, Some(lock) if lock > now) {
            return Ok(None);
        }
        job.lock_until = Some(until);
        Ok(Some(job.clone()))
    }

    async fn finish_run(&self, task_id: &str, outcome: RunOutcome) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        let job = inner
            .scheduled
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("scheduled job {task_id}")))?;

        job.run_count += 1;
        if outcome.status == RunStatus::Failure {
            job.failure_count += 1;
        }
        job.last_run_status = Some(outcome.status);
        job.last_run_started_at = Some(outcome.started_at);
        job.last_run_finished_at = Some(outcome.finished_at);
        job.next_run_after = outcome.next_run_after;
        job.lock_until = None;
        if let Some(err) = outcome.schedule_error {
            job.enabled = false;
            job.schedule_error = Some(err);
        }
        Ok(())
    }

    async fn record_run(&self, run: ScheduledJobRun) -> Result<(), Error> {
        self.inner.write().await.runs.push(run);
        Ok(())
    }

    async fn list_runs(&self, task_id: &str, limit: usize) -> Result<Vec<ScheduledJobRun>, Error> {
        let inner = self.inner.read().await;
        let mut runs: Vec<_> =
            inner.runs.iter().filter(|r| r.task_id == task_id).cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_runs_since(&self, since: DateTime<Utc>) -> Result<Vec<ScheduledJobRun>, Error> {
        let inner = self.inner.read().await;
        Ok(inner.runs.iter().filter(|r| r.started_at >= since).cloned().collect())
    }
}

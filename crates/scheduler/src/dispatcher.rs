use crate::{schedule, Registry, RunContext, RunReport};
use chrono::{DateTime, Duration, Utc};
use gateway::store::{RunOutcome, ScheduleStore, UploadSessionStore};
use gateway::JobEngine;
use models::{
    Error, RunStatus, RunTrigger, RuntimeState, ScheduleKind, ScheduledJob, ScheduledJobRun,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error messages persisted on run records are truncated to this length.
const MAX_ERROR_LEN: usize = 500;

/// Future fires shown by schedule preview.
const PREVIEW_COUNT: usize = 10;

/// Analytics windows are capped at thirty days.
const MAX_WINDOW_HOURS: u64 = 24 * 30;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick_interval: std::time::Duration,
    pub lease_ttl: std::time::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: std::time::Duration::from_secs(30),
            lease_ttl: std::time::Duration::from_secs(600),
        }
    }
}

/// Fields accepted when creating or updating a scheduled job.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobSpec {
    pub handler_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub schedule: ScheduleKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAnalytics {
    pub task_id: String,
    pub runs: u64,
    pub failures: u64,
    pub avg_duration_ms: i64,
    pub last_status: Option<RunStatus>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    pub window_hours: u64,
    pub total_runs: u64,
    pub total_failures: u64,
    pub tasks: Vec<TaskAnalytics>,
}

/// Ticks over due jobs, leasing each via a `lock_until` CAS so that two
/// dispatcher processes never run the same task concurrently. Runs within
/// one task are strictly serialized by the lease; different tasks are
/// independent.
pub struct Dispatcher {
    registry: Registry,
    schedules: Arc<dyn ScheduleStore>,
    sessions: Arc<dyn UploadSessionStore>,
    jobs: Arc<JobEngine>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        schedules: Arc<dyn ScheduleStore>,
        sessions: Arc<dyn UploadSessionStore>,
        jobs: Arc<JobEngine>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self { registry, schedules, sessions, jobs, config })
    }

    pub fn handler_types(&self) -> Vec<crate::HandlerInfo> {
        self.registry.list()
    }

    /// Serve ticks until signaled to stop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let executed = self.tick(Utc::now()).await;
            if executed > 0 {
                tracing::debug!(executed, "scheduler tick completed");
            }

            // Jitter by 10% in either direction to spread ticks across
            // competing dispatcher processes.
            let jitter = 0.9 + rand::random::<f64>() * 0.2;
            tokio::select! {
                () = tokio::time::sleep(self.config.tick_interval.mul_f64(jitter)) => {}
                () = shutdown.cancelled() => {
                    tracing::info!("scheduler dispatcher stopping");
                    return;
                }
            }
        }
    }

    /// One pass: lease and execute every enabled job that is due.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let jobs = match self.schedules.list_scheduled_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::error!(?err, "failed to load scheduled jobs (will retry)");
                return 0;
            }
        };

        let mut executed = 0;
        for job in jobs {
            if !job.enabled {
                continue;
            }
            let due = matches!(job.next_run_after, Some(next) if next <= now);
            let lock_stale = !matches!(job.lock_until, Some(lock) if lock > now);
            if !due || !lock_stale {
                continue;
            }

            let until = now + Duration::from_std(self.config.lease_ttl).unwrap_or_else(|_| Duration::minutes(10));
            match self
                .schedules
                .try_acquire_lease(&job.task_id, job.lock_until, until, now)
                .await
            {
                Ok(Some(leased)) => {
                    self.execute(&leased, RunTrigger::Scheduled, now).await;
                    executed += 1;
                }
                // Another dispatcher won the CAS; the job reads as running.
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(task = %job.task_id, ?err, "lease attempt failed");
                }
            }
        }
        executed
    }

    /// Run one job immediately under the same lease discipline.
    pub async fn run_now(&self, task_id: &str) -> Result<ScheduledJobRun, Error> {
        let job = self
            .schedules
            .get_scheduled_job(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scheduled job {task_id}")))?;
        if !job.enabled {
            return Err(Error::Validation(format!("scheduled job {task_id} is disabled")));
        }

        let now = Utc::now();
        let until = now + Duration::from_std(self.config.lease_ttl).unwrap_or_else(|_| Duration::minutes(10));
        let leased = self
            .schedules
            .try_acquire_lease(task_id, job.lock_until, until, now)
            .await?
            .ok_or_else(|| Error::Conflict(format!("scheduled job {task_id} is running")))?;

        Ok(self.execute(&leased, RunTrigger::Manual, now).await)
    }

    #[tracing::instrument(skip(self, job), fields(task = %job.task_id, handler = %job.handler_id))]
    async fn execute(
        &self,
        job: &ScheduledJob,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> ScheduledJobRun {
        let started_at = now;
        let outcome = match self.registry.get(&job.handler_id) {
            Some(handler) => {
                let ctx = RunContext {
                    sessions: &self.sessions,
                    schedules: &self.schedules,
                    jobs: &self.jobs,
                    now,
                    config: job.config.clone(),
                };
                handler.run(ctx).await
            }
            None => Err(anyhow::anyhow!("handler {:?} is not registered", job.handler_id)),
        };
        let finished_at = Utc::now();

        let (status, summary, error_message, details) = match outcome {
            Ok(RunReport { summary, details }) => {
                (RunStatus::Success, Some(summary), None, details)
            }
            Err(err) => {
                let message: String = err.to_string().chars().take(MAX_ERROR_LEN).collect();
                tracing::warn!(error = %message, "scheduled run failed");
                (RunStatus::Failure, None, Some(message), serde_json::Value::Null)
            }
        };

        // An invalid schedule (e.g. a cron edited behind our back) disables
        // the job with an error instead of wedging the dispatcher.
        let (next_run_after, schedule_error) = match schedule::next_fire(&job.schedule, now) {
            Ok(next) => (next, None),
            Err(err) => (None, Some(err.to_string())),
        };

        let run = ScheduledJobRun {
            id: models::new_id(),
            task_id: job.task_id.clone(),
            status,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            summary,
            error_message,
            details,
            trigger,
        };
        if let Err(err) = self.schedules.record_run(run.clone()).await {
            tracing::error!(?err, "failed to record run");
        }
        if let Err(err) = self
            .schedules
            .finish_run(
                &job.task_id,
                RunOutcome { status, started_at, finished_at, next_run_after, schedule_error },
            )
            .await
        {
            tracing::error!(?err, "failed to persist run outcome");
        }
        run
    }

    pub async fn create_job(
        &self,
        task_id: Option<String>,
        spec: ScheduledJobSpec,
    ) -> Result<ScheduledJob, Error> {
        let handler = self
            .registry
            .get(&spec.handler_id)
            .ok_or_else(|| Error::Validation(format!("unknown handler {:?}", spec.handler_id)))?;
        schedule::validate_schedule(&spec.schedule)?;
        handler.validate_config(&spec.config)?;

        let task_id = task_id.unwrap_or_else(models::new_id);
        if self.schedules.get_scheduled_job(&task_id).await?.is_some() {
            return Err(Error::Conflict(format!("scheduled job {task_id} exists")));
        }

        let now = Utc::now();
        let job = ScheduledJob {
            task_id,
            handler_id: spec.handler_id,
            name: spec.name,
            description: spec.description,
            enabled: spec.enabled,
            next_run_after: if spec.enabled {
                schedule::next_fire(&spec.schedule, now)?
            } else {
                None
            },
            schedule: spec.schedule,
            config: spec.config,
            run_count: 0,
            failure_count: 0,
            last_run_status: None,
            last_run_started_at: None,
            last_run_finished_at: None,
            lock_until: None,
            schedule_error: None,
        };
        self.schedules.upsert_scheduled_job(job.clone()).await?;
        Ok(job)
    }

    /// Update a job. All validation happens before any mutation: an invalid
    /// cron on update leaves the stored job untouched.
    pub async fn update_job(
        &self,
        task_id: &str,
        spec: ScheduledJobSpec,
    ) -> Result<ScheduledJob, Error> {
        let existing = self
            .schedules
            .get_scheduled_job(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scheduled job {task_id}")))?;

        let handler = self
            .registry
            .get(&spec.handler_id)
            .ok_or_else(|| Error::Validation(format!("unknown handler {:?}", spec.handler_id)))?;
        schedule::validate_schedule(&spec.schedule)?;
        handler.validate_config(&spec.config)?;

        let now = Utc::now();
        let job = ScheduledJob {
            next_run_after: if spec.enabled {
                schedule::next_fire(&spec.schedule, now)?
            } else {
                None
            },
            handler_id: spec.handler_id,
            name: spec.name,
            description: spec.description,
            enabled: spec.enabled,
            schedule: spec.schedule,
            config: spec.config,
            schedule_error: None,
            ..existing
        };
        self.schedules.upsert_scheduled_job(job.clone()).await?;
        Ok(job)
    }

    pub async fn delete_job(&self, task_id: &str) -> Result<(), Error> {
        if !self.schedules.delete_scheduled_job(task_id).await? {
            return Err(Error::NotFound(format!("scheduled job {task_id}")));
        }
        Ok(())
    }

    pub async fn get_job(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(ScheduledJob, RuntimeState), Error> {
        let job = self
            .schedules
            .get_scheduled_job(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scheduled job {task_id}")))?;
        let state = job.runtime_state(now);
        Ok((job, state))
    }

    pub async fn list_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ScheduledJob, RuntimeState)>, Error> {
        let mut jobs = self.schedules.list_scheduled_jobs().await?;
        jobs.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(jobs.into_iter().map(|job| {
            let state = job.runtime_state(now);
            (job, state)
        }).collect())
    }

    pub async fn list_runs(
        &self,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledJobRun>, Error> {
        self.schedules.list_runs(task_id, limit).await
    }

    pub async fn preview(&self, task_id: &str) -> Result<Vec<DateTime<Utc>>, Error> {
        let job = self
            .schedules
            .get_scheduled_job(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("scheduled job {task_id}")))?;
        schedule::preview_fires(&job.schedule, Utc::now(), PREVIEW_COUNT)
    }

    /// Aggregate run history over a bounded window.
    pub async fn analytics(&self, window_hours: Option<u64>) -> Result<Analytics, Error> {
        let window_hours = window_hours.unwrap_or(24).clamp(1, MAX_WINDOW_HOURS);
        let since = Utc::now() - Duration::hours(window_hours as i64);
        let runs = self.schedules.list_runs_since(since).await?;

        let mut by_task: std::collections::BTreeMap<String, Vec<&ScheduledJobRun>> =
            Default::default();
        for run in &runs {
            by_task.entry(run.task_id.clone()).or_default().push(run);
        }

        let tasks = by_task
            .into_iter()
            .map(|(task_id, mut runs)| {
                runs.sort_by_key(|r| r.started_at);
                let failures =
                    runs.iter().filter(|r| r.status == RunStatus::Failure).count() as u64;
                let total_ms: i64 = runs.iter().map(|r| r.duration_ms).sum();
                TaskAnalytics {
                    task_id,
                    runs: runs.len() as u64,
                    failures,
                    avg_duration_ms: total_ms / runs.len().max(1) as i64,
                    last_status: runs.last().map(|r| r.status),
                    last_run_at: runs.last().map(|r| r.started_at),
                }
            })
            .collect::<Vec<_>>();

        Ok(Analytics {
            window_hours,
            total_runs: runs.len() as u64,
            total_failures: runs.iter().filter(|r| r.status == RunStatus::Failure).count() as u64,
            tasks,
        })
    }
}

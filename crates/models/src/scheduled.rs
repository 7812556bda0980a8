use chrono::{DateTime, Utc};

/// Interval or cron scheduling for one job instance.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "scheduleType")]
pub enum ScheduleKind {
    Interval {
        #[serde(rename = "intervalSec")]
        interval_sec: u64,
    },
    Cron {
        #[serde(rename = "cronExpression")]
        cron_expression: String,
    },
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

/// Derived, read-only view of where a job sits in its cycle.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Disabled,
    Running,
    Idle,
    Scheduled,
    Pending,
}

/// One bound instance of a registered handler.
///
/// At most one leaseholder exists per `task_id` at a time: a runner holds
/// the lease iff `lock_until > now` and it set that value atomically.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub task_id: String,
    pub handler_id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub schedule: ScheduleKind,
    pub config: serde_json::Value,
    pub run_count: u64,
    pub failure_count: u64,
    pub last_run_status: Option<RunStatus>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub next_run_after: Option<DateTime<Utc>>,
    pub lock_until: Option<DateTime<Utc>>,
    /// Set when an invalid cron expression disabled the job.
    pub schedule_error: Option<String>,
}

impl ScheduledJob {
    /// Classify this job's runtime state as of `now`.
    pub fn runtime_state(&self, now: DateTime<Utc>) -> RuntimeState {
        if !self.enabled {
            return RuntimeState::Disabled;
        }
        if matches!(self.lock_until, Some(lock) if lock > now) {
            return RuntimeState::Running;
        }
        match self.next_run_after {
            None => RuntimeState::Idle,
            Some(next) if now < next => RuntimeState::Scheduled,
            Some(_) => RuntimeState::Pending,
        }
    }
}

/// Audit record of one handler execution.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobRun {
    pub id: String,
    pub task_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub details: serde_json::Value,
    pub trigger: RunTrigger,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> ScheduledJob {
        ScheduledJob {
            task_id: "t1".into(),
            handler_id: "h1".into(),
            name: "job".into(),
            description: String::new(),
            enabled: true,
            schedule: ScheduleKind::Interval { interval_sec: 60 },
            config: serde_json::Value::Null,
            run_count: 0,
            failure_count: 0,
            last_run_status: None,
            last_run_started_at: None,
            last_run_finished_at: None,
            next_run_after: None,
            lock_until: None,
            schedule_error: None,
        }
    }

    #[test]
    fn test_runtime_state_table() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let later = now + chrono::Duration::minutes(5);
        let earlier = now - chrono::Duration::minutes(5);

        let mut j = job();
        j.enabled = false;
        assert_eq!(j.runtime_state(now), RuntimeState::Disabled);

        let mut j = job();
        j.lock_until = Some(later);
        assert_eq!(j.runtime_state(now), RuntimeState::Running);

        let mut j = job();
        j.lock_until = Some(earlier); // Stale lease does not read as running.
        assert_eq!(j.runtime_state(now), RuntimeState::Idle);

        let mut j = job();
        j.next_run_after = Some(later);
        assert_eq!(j.runtime_state(now), RuntimeState::Scheduled);

        let mut j = job();
        j.next_run_after = Some(earlier);
        assert_eq!(j.runtime_state(now), RuntimeState::Pending);
    }

    #[test]
    fn test_schedule_serde_shape() {
        let j = serde_json::to_value(job()).unwrap();
        assert_eq!(j["scheduleType"], "interval");
        assert_eq!(j["intervalSec"], 60);

        let mut cron = job();
        cron.schedule = ScheduleKind::Cron { cron_expression: "0 0 * * * *".into() };
        let j = serde_json::to_value(cron).unwrap();
        assert_eq!(j["scheduleType"], "cron");
        assert_eq!(j["cronExpression"], "0 0 * * * *");
    }
}

use crate::{Category, RunContext, RunReport, TaskHandler};
use chrono::Duration;
use gateway::store::SessionPatch;
use models::{Error, UploadSession, UploadSessionStatus};

const DEFAULT_KEEP_DAYS: u64 = 30;
const DEFAULT_ACTIVE_GRACE_HOURS: u64 = 24;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Config {
    keep_days: u64,
    active_grace_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self { keep_days: DEFAULT_KEEP_DAYS, active_grace_hours: DEFAULT_ACTIVE_GRACE_HOURS }
    }
}

fn parse_config(value: &serde_json::Value) -> Result<Config, Error> {
    let config: Config = if value.is_null() {
        Config::default()
    } else {
        serde_json::from_value(value.clone())
            .map_err(|err| Error::Validation(format!("invalid cleanup config: {err}")))?
    };
    if config.keep_days < 1 {
        return Err(Error::Validation("keepDays must be at least 1".to_string()));
    }
    if config.active_grace_hours < 1 {
        return Err(Error::Validation("activeGraceHours must be at least 1".to_string()));
    }
    Ok(config)
}

#[derive(Debug, Default, serde::Serialize)]
struct StatusCounts {
    active: u64,
    completed: u64,
    aborted: u64,
    expired: u64,
    error: u64,
}

fn histogram(sessions: &[UploadSession]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for session in sessions {
        match session.status {
            UploadSessionStatus::Active => counts.active += 1,
            UploadSessionStatus::Completed => counts.completed += 1,
            UploadSessionStatus::Aborted => counts.aborted += 1,
            UploadSessionStatus::Expired => counts.expired += 1,
            UploadSessionStatus::Error => counts.error += 1,
        }
    }
    counts
}

/// Marks overdue `active` upload sessions expired and prunes terminal
/// sessions past their retention window.
pub struct CleanupUploadSessions;

#[async_trait::async_trait]
impl TaskHandler for CleanupUploadSessions {
    fn id(&self) -> &'static str {
        "cleanup_upload_sessions"
    }

    fn name(&self) -> &'static str {
        "Upload session cleanup"
    }

    fn category(&self) -> Category {
        Category::Maintenance
    }

    fn description(&self) -> &'static str {
        "Expires stale upload sessions and deletes old terminal sessions"
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "keepDays": { "type": "integer", "minimum": 1, "default": DEFAULT_KEEP_DAYS },
                "activeGraceHours": {
                    "type": "integer",
                    "minimum": 1,
                    "default": DEFAULT_ACTIVE_GRACE_HOURS,
                },
            },
        })
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), Error> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: RunContext<'_>) -> anyhow::Result<RunReport> {
        let config = parse_config(&ctx.config)?;
        let grace = Duration::hours(config.active_grace_hours as i64);
        let retention = Duration::days(config.keep_days as i64);

        let sessions = ctx.sessions.list_sessions().await?;
        let before = histogram(&sessions);

        // A session is overdue when the provider expiry passed or no
        // progress arrived within the grace window.
        let mut marked = 0u64;
        for session in &sessions {
            if session.status != UploadSessionStatus::Active {
                continue;
            }
            let provider_expired = matches!(session.expires_at, Some(at) if at < ctx.now);
            let gone_quiet = session.updated_at < ctx.now - grace;
            if !provider_expired && !gone_quiet {
                continue;
            }
            match ctx
                .sessions
                .update_session_if_active(
                    &session.id,
                    SessionPatch {
                        status: Some(UploadSessionStatus::Expired),
                        ..Default::default()
                    },
                    ctx.now,
                )
                .await
            {
                Ok(_) => marked += 1,
                // Lost the CAS to a concurrent transition; skip it.
                Err(Error::Conflict(_)) | Err(Error::UploadSessionNotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut deleted = 0u64;
        for session in &sessions {
            if !session.status.is_terminal() {
                continue;
            }
            if session.updated_at < ctx.now - retention
                && ctx.sessions.delete_session(&session.id).await?
            {
                deleted += 1;
            }
        }

        let after = histogram(&ctx.sessions.list_sessions().await?);
        Ok(RunReport {
            summary: format!("标记过期会话 {marked} 条，删除历史会话 {deleted} 条"),
            details: serde_json::json!({
                "before": before,
                "after": after,
                "keepDays": config.keep_days,
                "activeGraceHours": config.active_grace_hours,
            }),
        })
    }
}

use crate::{Category, RunContext, RunReport, TaskHandler};
use gateway::{CopyItem, CopyJobOptions, CopyPayload, TASK_TYPE_COPY};
use models::{Error, Principal};

/// At most this many pairs run per tick; the rest are truncated and
/// reported in the summary.
const MAX_PAIRS: usize = 100;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    source_path: String,
    target_path: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Config {
    mode: String,
    pairs: Vec<Pair>,
    #[serde(default = "default_skip_existing")]
    skip_existing: bool,
    #[serde(default)]
    max_concurrency: Option<usize>,
}

fn default_skip_existing() -> bool {
    true
}

fn parse_config(value: &serde_json::Value) -> Result<Config, Error> {
    let config: Config = serde_json::from_value(value.clone())
        .map_err(|err| Error::Validation(format!("invalid sync copy config: {err}")))?;
    if config.mode != "copyNew" {
        return Err(Error::Validation(format!(
            "unsupported mode {:?}, expected \"copyNew\"",
            config.mode
        )));
    }
    if config.pairs.is_empty() {
        return Err(Error::Validation("pairs must not be empty".to_string()));
    }
    for pair in &config.pairs {
        if pair.source_path.is_empty() || pair.target_path.is_empty() {
            return Err(Error::Validation("pair paths must not be empty".to_string()));
        }
    }
    Ok(config)
}

/// Enqueues one copy job for the configured path pairs, running under the
/// admin system principal.
pub struct ScheduledSyncCopy;

#[async_trait::async_trait]
impl TaskHandler for ScheduledSyncCopy {
    fn id(&self) -> &'static str {
        "scheduled_sync_copy"
    }

    fn name(&self) -> &'static str {
        "Scheduled sync copy"
    }

    fn category(&self) -> Category {
        Category::Business
    }

    fn description(&self) -> &'static str {
        "Copies configured source paths to their targets on a schedule"
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["mode", "pairs"],
            "properties": {
                "mode": { "type": "string", "enum": ["copyNew"] },
                "pairs": {
                    "type": "array",
                    "maxItems": MAX_PAIRS,
                    "items": {
                        "type": "object",
                        "required": ["sourcePath", "targetPath"],
                        "properties": {
                            "sourcePath": { "type": "string" },
                            "targetPath": { "type": "string" },
                        },
                    },
                },
                "skipExisting": { "type": "boolean", "default": true },
                "maxConcurrency": { "type": "integer", "minimum": 1, "maximum": 32 },
            },
        })
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), Error> {
        parse_config(config).map(|_| ())
    }

    async fn run(&self, ctx: RunContext<'_>) -> anyhow::Result<RunReport> {
        let mut config = parse_config(&ctx.config)?;

        let truncated = config.pairs.len().saturating_sub(MAX_PAIRS);
        if truncated > 0 {
            tracing::warn!(truncated, "sync copy pair list truncated");
            config.pairs.truncate(MAX_PAIRS);
        }

        let items: Vec<CopyItem> = config
            .pairs
            .iter()
            .map(|pair| CopyItem {
                source_path: pair.source_path.clone(),
                target_path: pair.target_path.clone(),
                skip_existing: None,
            })
            .collect();
        let pair_count = items.len();

        let payload = serde_json::to_value(CopyPayload {
            items,
            options: CopyJobOptions {
                skip_existing: config.skip_existing,
                max_concurrency: config.max_concurrency,
            },
        })
        .map_err(Error::internal)?;

        let job = ctx.jobs.create_job(TASK_TYPE_COPY, payload, Principal::system()).await?;

        let mut summary = format!("enqueued copy job {} with {pair_count} pairs", job.id);
        if truncated > 0 {
            summary.push_str(&format!(" ({truncated} truncated)"));
        }
        Ok(RunReport {
            summary,
            details: serde_json::json!({
                "jobId": job.id,
                "pairs": pair_count,
                "truncated": truncated,
                "skipExisting": config.skip_existing,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gateway::store::{ScheduleStore, UploadSessionStore};
    use gateway::{FileSystem, JobEngine, MemoryStore};
    use models::{DriverKind, JobStatus, Mount, StorageConfig, WebdavPolicy};
    use std::sync::Arc;
    use storage::{OpContext, UploadBody};
    use tokio_util::sync::CancellationToken;

    async fn fixture() -> (Arc<MemoryStore>, Arc<FileSystem>, Arc<JobEngine>, tempfile::TempDir, tempfile::TempDir)
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
        let jobs = JobEngine::new(store.clone(), fs.clone(), CancellationToken::new());
        (store, fs, jobs, dir_a, dir_b)
    }

    #[tokio::test]
    async fn test_enqueues_copy_job_that_completes() {
        let (store, fs, jobs, _a, _b) = fixture().await;
        let ctx = OpContext::default();
        let admin = Principal::system();
        fs.write(&admin, "/m0/sync/report.txt", UploadBody::from_bytes(&b"data"[..]), true, &ctx)
            .await
            .unwrap();

        let sessions: Arc<dyn UploadSessionStore> = store.clone();
        let schedules: Arc<dyn ScheduleStore> = store.clone();
        let report = ScheduledSyncCopy
            .run(RunContext {
                sessions: &sessions,
                schedules: &schedules,
                jobs: &jobs,
                now: Utc::now(),
                config: serde_json::json!({
                    "mode": "copyNew",
                    "pairs": [
                        { "sourcePath": "/m0/sync/report.txt", "targetPath": "/m1/sync/report.txt" },
                    ],
                    "maxConcurrency": 4,
                }),
            })
            .await
            .unwrap();

        let job_id = report.details["jobId"].as_str().unwrap().to_string();
        assert!(report.summary.contains("1 pairs"));

        for _ in 0..200 {
            let job = jobs.get_job(&admin, &job_id).await.unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Succeeded);
                assert_eq!(job.stats.success, 1);
                let exists = fs.stat(&admin, "/m1/sync/report.txt", &ctx).await;
                assert!(exists.is_ok());
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("copy job did not finish");
    }

    #[test]
    fn test_config_validation() {
        assert!(parse_config(&serde_json::json!({
            "mode": "copyNew",
            "pairs": [{ "sourcePath": "/a", "targetPath": "/b" }],
        }))
        .is_ok());

        assert!(parse_config(&serde_json::json!({ "mode": "mirror", "pairs": [] })).is_err());
        assert!(parse_config(&serde_json::json!({ "mode": "copyNew", "pairs": [] })).is_err());
        assert!(parse_config(&serde_json::json!({
            "mode": "copyNew",
            "pairs": [{ "sourcePath": "", "targetPath": "/b" }],
        }))
        .is_err());
    }

    #[test]
    fn test_truncation_over_cap() {
        let pairs: Vec<_> = (0..150)
            .map(|i| serde_json::json!({ "sourcePath": format!("/m0/{i}"), "targetPath": format!("/m1/{i}") }))
            .collect();
        let config =
            parse_config(&serde_json::json!({ "mode": "copyNew", "pairs": pairs })).unwrap();
        assert_eq!(config.pairs.len(), 150);
        // Truncation happens at run time, bounded by MAX_PAIRS.
        assert_eq!(config.pairs.len().min(MAX_PAIRS), 100);
    }
}

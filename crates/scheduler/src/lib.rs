mod dispatcher;
mod handlers;
mod schedule;

pub use dispatcher::{Analytics, Dispatcher, DispatcherConfig, ScheduledJobSpec, TaskAnalytics};
pub use handlers::{CleanupUploadSessions, ScheduledSyncCopy};
pub use schedule::{next_fire, preview_fires, validate_schedule};

use chrono::{DateTime, Utc};
use gateway::store::{ScheduleStore, UploadSessionStore};
use gateway::JobEngine;
use std::sync::Arc;

/// Handler classification surfaced to the admin UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Maintenance,
    Business,
}

/// Registry metadata for one handler type.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInfo {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub description: String,
    pub config_schema: serde_json::Value,
}

/// What one run of a handler reports back for auditing.
#[derive(Debug)]
pub struct RunReport {
    pub summary: String,
    pub details: serde_json::Value,
}

/// Everything a handler may touch during one run. `now` is captured once
/// per tick; handlers never read the clock themselves.
pub struct RunContext<'a> {
    pub sessions: &'a Arc<dyn UploadSessionStore>,
    pub schedules: &'a Arc<dyn ScheduleStore>,
    pub jobs: &'a Arc<JobEngine>,
    pub now: DateTime<Utc>,
    pub config: serde_json::Value,
}

/// A registered scheduled-task type.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn category(&self) -> Category;
    fn description(&self) -> &'static str;

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Reject bad configs at job creation time.
    fn validate_config(&self, config: &serde_json::Value) -> Result<(), models::Error> {
        let _ = config;
        Ok(())
    }

    async fn run(&self, ctx: RunContext<'_>) -> anyhow::Result<RunReport>;
}

/// Holds registered handlers, sorted by id.
pub struct Registry(Vec<Arc<dyn TaskHandler>>);

impl Registry {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Register a handler to be served. A duplicate id is a programming
    /// error and panics at startup.
    pub fn register<H: TaskHandler>(mut self, handler: H) -> Self {
        let index = match self.0.binary_search_by_key(&handler.id(), |h| h.id()) {
            Ok(_index) => panic!("a TaskHandler for {:?} is already registered", handler.id()),
            Err(index) => index,
        };
        self.0.insert(index, Arc::new(handler));
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.0
            .binary_search_by_key(&id, |h| h.id())
            .ok()
            .map(|index| self.0[index].clone())
    }

    pub fn list(&self) -> Vec<HandlerInfo> {
        self.0
            .iter()
            .map(|h| HandlerInfo {
                id: h.id().to_string(),
                name: h.name().to_string(),
                category: h.category(),
                description: h.description().to_string(),
                config_schema: h.config_schema(),
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(&'static str);

    #[async_trait::async_trait]
    impl TaskHandler for Probe {
        fn id(&self) -> &'static str {
            self.0
        }
        fn name(&self) -> &'static str {
            "probe"
        }
        fn category(&self) -> Category {
            Category::Maintenance
        }
        fn description(&self) -> &'static str {
            ""
        }
        async fn run(&self, _ctx: RunContext<'_>) -> anyhow::Result<RunReport> {
            Ok(RunReport { summary: "ok".into(), details: serde_json::Value::Null })
        }
    }

    #[test]
    fn test_registry_lookup_sorted() {
        let registry = Registry::new().register(Probe("zeta")).register(Probe("alpha"));
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("zeta").is_some());
        assert!(registry.get("missing").is_none());
        let ids: Vec<_> = registry.list().into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let _ = Registry::new().register(Probe("dup")).register(Probe("dup"));
    }
}

//! Server bootstrap: a JSON document describing storage configs, mounts,
//! principals, and scheduled jobs, loaded into the in-memory store at
//! startup. Config loading and secret decryption beyond this file are
//! external collaborators.

use crate::auth::{ApiKeyEntry, AuthConfig};
use anyhow::Context;
use chrono::Utc;
use gateway::MemoryStore;
use models::{Mount, PathPassword, StorageConfig, WebdavPolicy};
use std::sync::Arc;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
    #[serde(default)]
    pub storage_configs: Vec<StorageConfigEntry>,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    #[serde(default)]
    pub path_passwords: Vec<PathPasswordEntry>,
    #[serde(default)]
    pub scheduled_jobs: Vec<ScheduledJobEntry>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfigEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: models::DriverKind,
    pub config: serde_json::Value,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_owner")]
    pub owner_id: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountEntry {
    pub id: String,
    pub mount_path: String,
    pub storage_config_id: String,
    #[serde(default)]
    pub cache_ttl: u64,
    #[serde(default = "default_true")]
    pub web_proxy: bool,
    #[serde(default = "default_webdav_policy")]
    pub webdav_policy: WebdavPolicy,
    #[serde(default = "default_owner")]
    pub owner: String,
    pub sign_secret: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPasswordEntry {
    pub path: String,
    pub token: String,
    #[serde(default)]
    pub previous_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobEntry {
    pub task_id: String,
    #[serde(flatten)]
    pub spec: scheduler::ScheduledJobSpec,
}

fn default_owner() -> String {
    "admin".to_string()
}
fn default_true() -> bool {
    true
}
fn default_webdav_policy() -> WebdavPolicy {
    WebdavPolicy::Redirect
}

impl BootstrapConfig {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse config {path:?}"))
    }

    pub fn auth(&self) -> AuthConfig {
        AuthConfig { admin_token: self.admin_token.clone(), api_keys: self.api_keys.clone() }
    }

    /// Validate mount invariants and seed the store.
    pub async fn seed(&self, store: &Arc<MemoryStore>) -> anyhow::Result<()> {
        // Mount paths must be canonical and prefix-free.
        let mut paths: Vec<String> = Vec::new();
        for mount in &self.mounts {
            let canonical = vpath::canonicalize(&mount.mount_path)
                .map_err(|err| anyhow::anyhow!("mount {}: {err}", mount.id))?;
            if canonical != mount.mount_path {
                anyhow::bail!(
                    "mount {} path {:?} is not canonical (expected {canonical:?})",
                    mount.id,
                    mount.mount_path
                );
            }
            paths.push(canonical);
        }
        for (i, a) in paths.iter().enumerate() {
            for b in paths.iter().skip(i + 1) {
                if vpath::is_strict_parent(a, b) || vpath::is_strict_parent(b, a) || a == b {
                    anyhow::bail!("mount paths {a:?} and {b:?} overlap");
                }
            }
        }

        let mut defaults_per_owner: std::collections::HashMap<&str, usize> = Default::default();
        for entry in &self.storage_configs {
            if entry.is_default {
                *defaults_per_owner.entry(entry.owner_id.as_str()).or_default() += 1;
            }
        }
        if let Some((owner, _)) = defaults_per_owner.iter().find(|(_, count)| **count > 1) {
            anyhow::bail!("owner {owner:?} has more than one default storage config");
        }

        for entry in &self.storage_configs {
            store
                .put_storage_config(StorageConfig {
                    id: entry.id.clone(),
                    kind: entry.kind,
                    config: entry.config.clone(),
                    is_public: entry.is_public,
                    is_default: entry.is_default,
                    owner_id: entry.owner_id.clone(),
                })
                .await;
        }
        for entry in &self.mounts {
            store
                .put_mount(Mount {
                    id: entry.id.clone(),
                    mount_path: entry.mount_path.clone(),
                    storage_config_id: entry.storage_config_id.clone(),
                    cache_ttl: entry.cache_ttl,
                    web_proxy: entry.web_proxy,
                    webdav_policy: entry.webdav_policy,
                    owner: entry.owner.clone(),
                    sign_secret: entry.sign_secret.clone(),
                    created_at: Utc::now(),
                    last_used_at: None,
                })
                .await;
        }
        for entry in &self.path_passwords {
            store
                .put_path_password(PathPassword {
                    path: entry.path.clone(),
                    token: entry.token.clone(),
                    previous_token: entry.previous_token.clone(),
                    updated_at: Utc::now(),
                })
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_rejects_overlapping_mounts() {
        let config: BootstrapConfig = serde_json::from_value(serde_json::json!({
            "mounts": [
                { "id": "a", "mountPath": "/m", "storageConfigId": "s", "signSecret": "x" },
                { "id": "b", "mountPath": "/m/sub", "storageConfigId": "s", "signSecret": "x" },
            ],
        }))
        .unwrap();
        let store = MemoryStore::new();
        let err = config.seed(&store).await.unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[tokio::test]
    async fn test_seed_rejects_duplicate_defaults() {
        let config: BootstrapConfig = serde_json::from_value(serde_json::json!({
            "storageConfigs": [
                { "id": "s1", "type": "local", "config": {}, "isDefault": true },
                { "id": "s2", "type": "local", "config": {}, "isDefault": true },
            ],
        }))
        .unwrap();
        let store = MemoryStore::new();
        let err = config.seed(&store).await.unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[tokio::test]
    async fn test_seed_accepts_sibling_mounts() {
        let config: BootstrapConfig = serde_json::from_value(serde_json::json!({
            "storageConfigs": [
                { "id": "s1", "type": "local", "config": {}, "isPublic": true },
            ],
            "mounts": [
                { "id": "a", "mountPath": "/team/docs", "storageConfigId": "s1", "signSecret": "x" },
                { "id": "b", "mountPath": "/team/media", "storageConfigId": "s1", "signSecret": "x" },
            ],
        }))
        .unwrap();
        let store = MemoryStore::new();
        config.seed(&store).await.unwrap();
    }
}

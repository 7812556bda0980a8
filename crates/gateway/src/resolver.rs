use crate::store::MountStore;
use models::{Error, Mount, Principal, StorageConfig};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Where a virtual path landed.
#[derive(Debug)]
pub enum Resolved {
    /// The longest visible mount whose prefix covers the path.
    Mount { mount: Mount, config: StorageConfig, subpath: String },
    /// The path is strictly above one or more visible mounts.
    VirtualDirectory { path: String, children: Vec<String> },
}

/// Maps virtual paths to mounts and enforces per-principal visibility.
pub struct MountResolver {
    store: Arc<dyn MountStore>,
}

impl MountResolver {
    pub fn new(store: Arc<dyn MountStore>) -> Self {
        Self { store }
    }

    /// Mounts whose storage config this principal may use. Admins see all;
    /// API keys see the intersection of public configs and their ACL.
    pub async fn visible_mounts(
        &self,
        principal: &Principal,
    ) -> Result<Vec<(Mount, StorageConfig)>, Error> {
        let mut visible = Vec::new();
        for mount in self.store.list_mounts().await? {
            let Some(config) = self.store.get_storage_config(&mount.storage_config_id).await?
            else {
                tracing::warn!(mount = %mount.id, "mount references a missing storage config");
                continue;
            };
            if principal.may_use_config(&config.id, config.is_public) {
                visible.push((mount, config));
            }
        }
        Ok(visible)
    }

    /// Resolve a canonical path for a principal, enforcing the path scope.
    pub async fn resolve(&self, principal: &Principal, canonical: &str) -> Result<Resolved, Error> {
        let visible = self.visible_mounts(principal).await?;

        // Longest mount_path prefix wins; mount paths are prefix-free per
        // visibility scope, so at most one can match, but defend anyway.
        let best = visible
            .iter()
            .filter(|(mount, _)| mount.contains(canonical))
            .max_by_key(|(mount, _)| mount.mount_path.len());

        if let Some((mount, config)) = best {
            if !principal.in_scope(canonical) {
                return Err(Error::Forbidden(format!("{canonical} is outside the allowed scope")));
            }
            let subpath = vpath::strip_mount_prefix(&mount.mount_path, canonical)
                .ok_or_else(|| Error::internal(anyhow::anyhow!("prefix vanished after match")))?;
            return Ok(Resolved::Mount {
                mount: mount.clone(),
                config: config.clone(),
                subpath: subpath.to_string(),
            });
        }

        // No mount covers the path; it may still be a virtual directory
        // above some mounts.
        let mut children = BTreeSet::new();
        for (mount, _) in &visible {
            if let Some(segment) = vpath::next_segment(canonical, &mount.mount_path) {
                let child_path = if canonical == "/" {
                    format!("/{segment}")
                } else {
                    format!("{canonical}/{segment}")
                };
                if principal.in_scope(&child_path) || leads_into_scope(principal, &child_path) {
                    children.insert(segment.to_string());
                }
            }
        }
        if !children.is_empty() {
            return Ok(Resolved::VirtualDirectory {
                path: canonical.to_string(),
                children: children.into_iter().collect(),
            });
        }
        Err(Error::NotFound(canonical.to_string()))
    }

    /// Gate directory listings behind a per-path password token. Admins
    /// bypass; a token matching the previous secret reports the rotation.
    pub async fn check_path_token(
        &self,
        principal: &Principal,
        canonical: &str,
        provided: Option<&str>,
    ) -> Result<(), Error> {
        if principal.is_admin() {
            return Ok(());
        }
        let Some(password) = self.store.path_password(canonical).await? else {
            return Ok(());
        };
        match provided {
            Some(token) if token == password.token => Ok(()),
            Some(token) if password.previous_token.as_deref() == Some(token) => {
                Err(Error::PasswordRequired { changed: true })
            }
            _ => Err(Error::PasswordRequired { changed: false }),
        }
    }
}

/// True when `path` is an ancestor of the principal's `basic_path`, so the
/// principal can browse down toward its scope.
fn leads_into_scope(principal: &Principal, path: &str) -> bool {
    match principal {
        Principal::Admin { .. } => true,
        Principal::ApiKey { basic_path, .. } => vpath::is_strict_parent(path, basic_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use models::WebdavPolicy;

    async fn store_with(mounts: &[(&str, &str, bool)]) -> Arc<MemoryStore> {
        // (mount_path, config_id, is_public)
        let store = MemoryStore::new();
        for (i, (path, config_id, is_public)) in mounts.iter().enumerate() {
            store
                .put_storage_config(StorageConfig {
                    id: config_id.to_string(),
                    kind: models::DriverKind::Local,
                    config: serde_json::Value::Null,
                    is_public: *is_public,
                    is_default: i == 0,
                    owner_id: "admin".into(),
                })
                .await;
            store
                .put_mount(Mount {
                    id: format!("m{i}"),
                    mount_path: path.to_string(),
                    storage_config_id: config_id.to_string(),
                    cache_ttl: 0,
                    web_proxy: true,
                    webdav_policy: WebdavPolicy::Redirect,
                    owner: "admin".into(),
                    sign_secret: "secret".into(),
                    created_at: Utc::now(),
                    last_used_at: None,
                })
                .await;
        }
        store
    }

    fn admin() -> Principal {
        Principal::Admin { id: "root".into() }
    }

    fn api_key(basic_path: &str, configs: &[&str]) -> Principal {
        Principal::ApiKey {
            id: "key".into(),
            basic_path: basic_path.into(),
            storage_config_ids: configs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let store = store_with(&[("/a", "s1", true), ("/a-deep", "s2", true)]).await;
        let resolver = MountResolver::new(store);

        match resolver.resolve(&admin(), "/a/x/y.txt").await.unwrap() {
            Resolved::Mount { mount, subpath, .. } => {
                assert_eq!(mount.mount_path, "/a");
                assert_eq!(subpath, "x/y.txt");
            }
            other => panic!("unexpected {other:?}"),
        }
        match resolver.resolve(&admin(), "/a-deep/z").await.unwrap() {
            Resolved::Mount { mount, subpath, .. } => {
                assert_eq!(mount.mount_path, "/a-deep");
                assert_eq!(subpath, "z");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_virtual_directory_above_mounts() {
        let store = store_with(&[("/team/docs", "s1", true), ("/team/media", "s2", true)]).await;
        let resolver = MountResolver::new(store);

        match resolver.resolve(&admin(), "/team").await.unwrap() {
            Resolved::VirtualDirectory { path, children } => {
                assert_eq!(path, "/team");
                assert_eq!(children, vec!["docs".to_string(), "media".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match resolver.resolve(&admin(), "/").await.unwrap() {
            Resolved::VirtualDirectory { children, .. } => {
                assert_eq!(children, vec!["team".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let store = store_with(&[("/a", "s1", true)]).await;
        let resolver = MountResolver::new(store);
        let err = resolver.resolve(&admin(), "/nope").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_api_key_visibility_and_scope() {
        let store =
            store_with(&[("/pub", "s1", true), ("/hidden", "s2", false), ("/other", "s3", true)])
                .await;
        let resolver = MountResolver::new(store);

        // ACL grants s1 and s2, but s2 is not public: only /pub resolves.
        let key = api_key("/", &["s1", "s2"]);
        assert!(matches!(
            resolver.resolve(&key, "/pub/f").await.unwrap(),
            Resolved::Mount { .. }
        ));
        assert_eq!(resolver.resolve(&key, "/hidden/f").await.unwrap_err().code(), "NOT_FOUND");
        // s3 is public but not in the ACL.
        assert_eq!(resolver.resolve(&key, "/other/f").await.unwrap_err().code(), "NOT_FOUND");

        // Scope prefix denies resolvable mounts outside basic_path.
        let scoped = api_key("/pub/inner", &["s1"]);
        let err = resolver.resolve(&scoped, "/pub/elsewhere").await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        assert!(matches!(
            resolver.resolve(&scoped, "/pub/inner/f").await.unwrap(),
            Resolved::Mount { .. }
        ));
    }

    #[tokio::test]
    async fn test_path_token_gate() {
        let store = store_with(&[("/p", "s1", true)]).await;
        store
            .put_path_password(models::PathPassword {
                path: "/p/locked".into(),
                token: "new-token".into(),
                previous_token: Some("old-token".into()),
                updated_at: Utc::now(),
            })
            .await;
        let resolver = MountResolver::new(store);
        let key = api_key("/", &["s1"]);

        resolver.check_path_token(&key, "/p/open", None).await.unwrap();
        resolver.check_path_token(&key, "/p/locked", Some("new-token")).await.unwrap();
        resolver.check_path_token(&admin(), "/p/locked", None).await.unwrap();

        let err = resolver.check_path_token(&key, "/p/locked", None).await.unwrap_err();
        assert_eq!(err.sub_code(), Some("PASSWORD_REQUIRED"));

        let err =
            resolver.check_path_token(&key, "/p/locked", Some("old-token")).await.unwrap_err();
        assert_eq!(err.sub_code(), Some("PASSWORD_CHANGED"));
    }
}

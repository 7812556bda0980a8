use chrono::{DateTime, Utc};

/// How WebDAV-policy clients are redirected for this mount.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebdavPolicy {
    Redirect,
    UseProxyUrl,
    NativeProxy,
}

/// A virtual path prefix bound to a storage backend.
///
/// `mount_path` is always absolute with no trailing slash unless it is the
/// root mount. Mount paths form a prefix-free set within one visibility
/// scope: no mount is a prefix of another mount visible to the same
/// principal.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub id: String,
    pub mount_path: String,
    pub storage_config_id: String,
    /// Listing cache TTL in seconds; zero disables caching.
    pub cache_ttl: u64,
    pub web_proxy: bool,
    pub webdav_policy: WebdavPolicy,
    pub owner: String,
    /// Secret for proxy-URL signatures; rotation invalidates permanent signs.
    pub sign_secret: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Mount {
    /// True when `path` equals the mount path or falls beneath it.
    pub fn contains(&self, canonical: &str) -> bool {
        vpath_contains(&self.mount_path, canonical)
    }
}

fn vpath_contains(mount_path: &str, canonical: &str) -> bool {
    if mount_path == "/" {
        return true;
    }
    match canonical.strip_prefix(mount_path) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// The access token protecting one virtual directory, with the previous
/// value retained so a stale client can be told the password rotated.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PathPassword {
    pub path: String,
    pub token: String,
    pub previous_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(path: &str) -> Mount {
        Mount {
            id: "m1".into(),
            mount_path: path.into(),
            storage_config_id: "s1".into(),
            cache_ttl: 0,
            web_proxy: false,
            webdav_policy: WebdavPolicy::Redirect,
            owner: "admin".into(),
            sign_secret: "secret".into(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn test_contains_segment_boundary() {
        let m = mount("/m");
        assert!(m.contains("/m"));
        assert!(m.contains("/m/a/b"));
        assert!(!m.contains("/mnt"));
        assert!(!m.contains("/"));
        assert!(mount("/").contains("/anything"));
    }
}

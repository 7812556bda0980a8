use std::collections::BTreeSet;

/// The authenticated caller of a gateway operation.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Principal {
    /// Administrators see every mount and storage config.
    Admin { id: String },
    /// API-key identities see public configs intersected with their ACL,
    /// inside their required `basic_path` prefix.
    ApiKey {
        id: String,
        basic_path: String,
        storage_config_ids: BTreeSet<String>,
    },
}

impl Principal {
    pub fn id(&self) -> &str {
        match self {
            Principal::Admin { id } => id,
            Principal::ApiKey { id, .. } => id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::Admin { .. })
    }

    /// The system principal scheduled jobs run under.
    pub fn system() -> Self {
        Principal::Admin { id: "system".to_string() }
    }

    /// True when `canonical` falls inside this principal's path scope.
    pub fn in_scope(&self, canonical: &str) -> bool {
        match self {
            Principal::Admin { .. } => true,
            Principal::ApiKey { basic_path, .. } => {
                if basic_path == "/" {
                    return true;
                }
                match canonical.strip_prefix(basic_path.as_str()) {
                    Some("") => true,
                    Some(rest) => rest.starts_with('/'),
                    None => false,
                }
            }
        }
    }

    /// True when this principal may use the given storage config.
    pub fn may_use_config(&self, config_id: &str, is_public: bool) -> bool {
        match self {
            Principal::Admin { .. } => true,
            Principal::ApiKey { storage_config_ids, .. } => {
                is_public && storage_config_ids.contains(config_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key(basic_path: &str, configs: &[&str]) -> Principal {
        Principal::ApiKey {
            id: "k1".into(),
            basic_path: basic_path.into(),
            storage_config_ids: configs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_scope() {
        let p = api_key("/team", &[]);
        assert!(p.in_scope("/team"));
        assert!(p.in_scope("/team/x"));
        assert!(!p.in_scope("/teammate"));
        assert!(!p.in_scope("/other"));
        assert!(api_key("/", &[]).in_scope("/anything"));
        assert!(Principal::system().in_scope("/anything"));
    }

    #[test]
    fn test_config_visibility() {
        let p = api_key("/", &["s1"]);
        // Visibility is the intersection of public configs and the ACL.
        assert!(p.may_use_config("s1", true));
        assert!(!p.may_use_config("s1", false));
        assert!(!p.may_use_config("s2", true));
        assert!(Principal::system().may_use_config("s2", false));
    }
}

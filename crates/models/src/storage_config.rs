/// The backend family a storage config drives.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Local,
    S3,
    Webdav,
    Graph,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriverKind::Local => "local",
            DriverKind::S3 => "s3",
            DriverKind::Webdav => "webdav",
            DriverKind::Graph => "graph",
        };
        f.write_str(s)
    }
}

/// Driver-specific configuration plus visibility flags.
///
/// `config` is the decrypted driver-specific document (endpoint, bucket,
/// credentials, root prefix, and so on); the encrypted-credentials store and
/// its decryption live upstream of this crate, and each driver deserializes
/// `config` into its own config type at init.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub id: String,
    pub kind: DriverKind,
    pub config: serde_json::Value,
    pub is_public: bool,
    /// Exactly one config per owner may be the default.
    pub is_default: bool,
    pub owner_id: String,
}

/// Grant of one storage config to one principal.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct StorageAcl {
    pub subject_type: String,
    pub subject_id: String,
    pub storage_config_id: String,
}

/// Details of an unexpected backend response, surfaced after retries.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct UpstreamError {
    pub status: u16,
    pub code: Option<String>,
    pub context: String,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream returned status {} ({})", self.status, self.context)
    }
}

/// The error surface shared by every layer of the gateway.
///
/// Each variant maps to a stable wire `code`; clients never see the cause
/// chain of `Internal`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("password required for this path")]
    PasswordRequired {
        /// The previously-valid token was presented after a rotation.
        changed: bool,
    },
    #[error("validation: {0}")]
    Validation(String),
    #[error("driver does not support this environment: {0}")]
    DriverUnsupportedEnv(String),
    #[error("driver is read-only")]
    DriverReadonly,
    #[error("path resolves through a symlink escaping the storage root: {0}")]
    DriverSymlinkEscape(String),
    #[error("path escapes the storage root: {0}")]
    DriverPathOutOfRoot(String),
    #[error("{0}")]
    Upstream(UpstreamError),
    #[error("upload session not found or no longer resumable")]
    UploadSessionNotFound,
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Forbidden(_) | Error::PasswordRequired { .. } => "FORBIDDEN",
            Error::Validation(_) => "VALIDATION",
            Error::DriverUnsupportedEnv(_) => "DRIVER_UNSUPPORTED_ENV",
            Error::DriverReadonly => "DRIVER_READONLY",
            Error::DriverSymlinkEscape(_) => "DRIVER_SYMLINK_ESCAPE",
            Error::DriverPathOutOfRoot(_) => "DRIVER_PATH_OUT_OF_ROOT",
            Error::Upstream(_) => "UPSTREAM",
            Error::UploadSessionNotFound => "UPLOAD_SESSION_NOT_FOUND",
            Error::Cancelled => "CANCELLED",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Sub-reason code, currently only for rotated path passwords.
    pub fn sub_code(&self) -> Option<&'static str> {
        match self {
            Error::PasswordRequired { changed: true } => Some("PASSWORD_CHANGED"),
            Error::PasswordRequired { changed: false } => Some("PASSWORD_REQUIRED"),
            _ => None,
        }
    }

    /// The message exposed to clients. `Internal` never leaks its cause.
    pub fn client_message(&self) -> String {
        match self {
            Error::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Error::Internal(err.into())
    }

    pub fn upstream(status: u16, code: Option<String>, context: impl Into<String>) -> Self {
        Error::Upstream(UpstreamError {
            status,
            code,
            context: context.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(Error::DriverReadonly.code(), "DRIVER_READONLY");
        assert_eq!(
            Error::PasswordRequired { changed: true }.sub_code(),
            Some("PASSWORD_CHANGED")
        );
        assert_eq!(Error::upstream(502, None, "webdav PROPFIND").code(), "UPSTREAM");
    }

    #[test]
    fn test_internal_hides_cause() {
        let err = Error::internal(anyhow::anyhow!("secret connection string"));
        assert_eq!(err.client_message(), "internal error");
    }
}

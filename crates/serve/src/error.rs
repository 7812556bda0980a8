use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use models::Error;

/// The JSON envelope every endpoint answers with.
#[derive(Debug, serde::Serialize)]
pub struct Envelope<T: serde::Serialize> {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub success: bool,
}

/// A successful envelope.
pub fn ok<T: serde::Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: "OK".to_string(),
        message: "success".to_string(),
        data: Some(data),
        success: true,
    })
}

/// Error wrapper mapping the shared error kinds onto HTTP statuses.
/// 5xx is reserved for `INTERNAL` and `UPSTREAM`.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Forbidden(_) | Error::PasswordRequired { .. } => StatusCode::FORBIDDEN,
        Error::Validation(_)
        | Error::DriverUnsupportedEnv(_)
        | Error::DriverPathOutOfRoot(_)
        | Error::Cancelled => StatusCode::BAD_REQUEST,
        Error::DriverReadonly | Error::DriverSymlinkEscape(_) => StatusCode::FORBIDDEN,
        Error::UploadSessionNotFound => StatusCode::NOT_FOUND,
        Error::Upstream(_) => StatusCode::BAD_GATEWAY,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if matches!(err, Error::Internal(_)) {
            tracing::error!(error = ?err, "request failed internally");
        }
        let body = Envelope {
            code: err.code().to_string(),
            message: err.client_message(),
            data: err.sub_code().map(|reason| serde_json::json!({ "reason": reason })),
            success: false,
        };
        (status_of(&err), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(&Error::DriverReadonly), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(&Error::upstream(503, None, "s3")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(&Error::internal(anyhow::anyhow!("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        // Only INTERNAL and UPSTREAM may map to 5xx.
        for err in [
            Error::Validation("v".into()),
            Error::Conflict("c".into()),
            Error::UploadSessionNotFound,
            Error::Cancelled,
            Error::DriverUnsupportedEnv("e".into()),
        ] {
            assert!(status_of(&err).is_client_error());
        }
    }
}

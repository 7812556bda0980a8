use crate::auth::Auth;
use crate::error::{ok, ApiError};
use crate::AppState;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use storage::{CompletedPart, MultipartInit, OpContext};

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitBody {
    pub path: String,
    #[serde(flatten)]
    pub init: MultipartInit,
}

pub async fn init(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<InitBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let started = state.sessions.init(&principal, &body.path, body.init, &ctx).await?;
    Ok(ok(started))
}

pub async fn get(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.get(&principal, &session_id).await?;
    Ok(ok(session))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteBody {
    #[serde(default)]
    pub parts: Vec<CompletedPart>,
}

pub async fn complete(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(session_id): Path<String>,
    Json(body): Json<CompleteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let result = state.sessions.complete(&principal, &session_id, &body.parts, &ctx).await?;
    Ok(ok(result))
}

pub async fn abort(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    state.sessions.abort(&principal, &session_id, &ctx).await?;
    Ok(ok(serde_json::json!({ "aborted": true })))
}

pub async fn list_parts(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let parts = state.sessions.list_parts(&principal, &session_id, &ctx).await?;
    Ok(ok(parts))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBody {
    pub part_numbers: Vec<u32>,
}

pub async fn refresh_urls(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(session_id): Path<String>,
    Json(body): Json<RefreshBody>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = OpContext::default();
    let plans = state
        .sessions
        .refresh_urls(&principal, &session_id, &body.part_numbers, &ctx)
        .await?;
    Ok(ok(plans))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressBody {
    pub bytes_uploaded: u64,
    pub uploaded_parts: u32,
    #[serde(default)]
    pub next_expected_range: Option<String>,
}

pub async fn progress(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(session_id): Path<String>,
    Json(body): Json<ProgressBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .record_progress(
            &principal,
            &session_id,
            body.bytes_uploaded,
            body.uploaded_parts,
            body.next_expected_range,
        )
        .await?;
    Ok(ok(session))
}

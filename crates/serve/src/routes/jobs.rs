use crate::auth::Auth;
use crate::error::{ok, ApiError};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use gateway::JobFilter;
use models::JobStatus;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobBody {
    pub task_type: String,
    pub items: serde_json::Value,
    #[serde(default)]
    pub options: serde_json::Value,
}

pub async fn create(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Json(body): Json<CreateJobBody>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = serde_json::json!({ "items": body.items, "options": body.options });
    let job = state.jobs.create_job(&body.task_type, payload, principal).await?;
    Ok(ok(job))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state
        .jobs
        .list_jobs(
            &principal,
            JobFilter {
                task_type: query.task_type,
                status: query.status,
                principal: None,
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await?;
    Ok(ok(jobs))
}

pub async fn get(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.jobs.get_job(&principal, &job_id).await?;
    Ok(ok(job))
}

pub async fn cancel(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.jobs.cancel_job(&principal, &job_id).await?;
    Ok(ok(job))
}

pub async fn delete(
    State(state): State<AppState>,
    Auth(principal): Auth,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.jobs.delete_job(&principal, &job_id).await?;
    Ok(ok(serde_json::json!({ "deleted": true })))
}

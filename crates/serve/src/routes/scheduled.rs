use crate::auth::AdminAuth;
use crate::error::{ok, ApiError};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use models::{RuntimeState, ScheduledJob};
use scheduler::ScheduledJobSpec;

/// A job row decorated with its derived runtime state.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    #[serde(flatten)]
    pub job: ScheduledJob,
    pub runtime_state: RuntimeState,
}

pub async fn types(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.dispatcher.handler_types()))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.dispatcher.list_jobs(Utc::now()).await?;
    Ok(ok(jobs
        .into_iter()
        .map(|(job, runtime_state)| JobView { job, runtime_state })
        .collect::<Vec<_>>()))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobBody {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub spec: ScheduledJobSpec,
}

pub async fn create_job(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
    Json(body): Json<CreateJobBody>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.dispatcher.create_job(body.task_id, body.spec).await?;
    Ok(ok(job))
}

pub async fn get_job(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (job, runtime_state) = state.dispatcher.get_job(&task_id, Utc::now()).await?;
    let preview = state.dispatcher.preview(&task_id).await.unwrap_or_default();
    Ok(ok(serde_json::json!({
        "job": JobView { job, runtime_state },
        "nextFires": preview,
    })))
}

pub async fn update_job(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
    Path(task_id): Path<String>,
    Json(spec): Json<ScheduledJobSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.dispatcher.update_job(&task_id, spec).await?;
    Ok(ok(job))
}

pub async fn delete_job(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.dispatcher.delete_job(&task_id).await?;
    Ok(ok(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, serde::Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
    Path(task_id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state
        .dispatcher
        .list_runs(&task_id, query.limit.unwrap_or(50).min(500))
        .await?;
    Ok(ok(runs))
}

pub async fn run_now(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.dispatcher.run_now(&task_id).await?;
    Ok(ok(run))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
    #[serde(default)]
    pub window_hours: Option<u64>,
}

pub async fn analytics(
    State(state): State<AppState>,
    AdminAuth(_): AdminAuth,
    Query(query): Query<AnalyticsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let analytics = state.dispatcher.analytics(query.window_hours).await?;
    Ok(ok(analytics))
}

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;

use auth::AuthConfig;
use axum::routing::{delete, get, post, put};
use axum::Router;
use gateway::{FileSystem, JobEngine, UploadSessionService};
use scheduler::Dispatcher;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub fs: Arc<FileSystem>,
    pub jobs: Arc<JobEngine>,
    pub sessions: Arc<UploadSessionService>,
    pub dispatcher: Arc<Dispatcher>,
    pub auth: Arc<AuthConfig>,
}

pub fn router(state: AppState) -> Router {
    let fs_routes = Router::new()
        .route("/list", get(routes::fs::list))
        .route("/get", get(routes::fs::get))
        .route("/download", get(routes::fs::download))
        .route("/file-link", get(routes::fs::file_link))
        .route("/search", get(routes::fs::search))
        .route("/upload", put(routes::fs::upload))
        .route("/mkdir", post(routes::fs::mkdir))
        .route("/rename", post(routes::fs::rename))
        .route("/batch-remove", delete(routes::fs::batch_remove))
        .route("/batch-copy", post(routes::fs::batch_copy))
        .route("/batch-copy-commit", post(routes::fs::batch_copy_commit))
        .route("/presign-upload", post(routes::fs::presign_upload))
        .route("/jobs", post(routes::jobs::create).get(routes::jobs::list))
        .route("/jobs/:job_id", get(routes::jobs::get).delete(routes::jobs::delete))
        .route("/jobs/:job_id/cancel", post(routes::jobs::cancel))
        .route("/multipart/init", post(routes::uploads::init))
        .route("/multipart/:session_id", get(routes::uploads::get))
        .route("/multipart/:session_id/complete", post(routes::uploads::complete))
        .route("/multipart/:session_id/abort", post(routes::uploads::abort))
        .route("/multipart/:session_id/parts", get(routes::uploads::list_parts))
        .route("/multipart/:session_id/refresh-urls", post(routes::uploads::refresh_urls))
        .route("/multipart/:session_id/progress", post(routes::uploads::progress));

    let scheduled_routes = Router::new()
        .route("/types", get(routes::scheduled::types))
        .route(
            "/jobs",
            get(routes::scheduled::list_jobs).post(routes::scheduled::create_job),
        )
        .route(
            "/jobs/:task_id",
            get(routes::scheduled::get_job)
                .put(routes::scheduled::update_job)
                .delete(routes::scheduled::delete_job),
        )
        .route("/jobs/:task_id/runs", get(routes::scheduled::list_runs))
        .route("/jobs/:task_id/run", post(routes::scheduled::run_now))
        .route("/analytics", get(routes::scheduled::analytics));

    Router::new()
        .nest("/api/fs", fs_routes)
        .nest("/api/admin/scheduled", scheduled_routes)
        .route("/api/p/*path", get(routes::proxy::proxy))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

//! Router configuration for the job API.

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/queue", get(handlers::queue_depth))
        // Jobs
        .route("/jobs", post(handlers::create_job).get(handlers::list_jobs))
        .route("/jobs/draft", post(handlers::create_draft))
        .route("/jobs/changes", get(handlers::jobs_changes))
        .route(
            "/jobs/:id",
            get(handlers::get_job)
                .patch(handlers::patch_job)
                .delete(handlers::delete_job),
        )
        .route("/jobs/:id/details", get(handlers::get_job_details))
        .route("/jobs/:id/result", get(handlers::get_result_url))
        .route("/jobs/:id/start", post(handlers::start_draft))
        .route("/jobs/:id/pause", post(handlers::pause_job))
        .route("/jobs/:id/resume", post(handlers::resume_job))
        .route("/jobs/:id/restart", post(handlers::restart_job))
        // Storage proxy
        .route("/api/storage/exists/*key", get(handlers::storage_exists))
        .route("/api/storage/upload/*key", post(handlers::storage_upload))
        .route("/api/storage/upload-text", post(handlers::storage_upload_text))
        .route("/api/storage/download/*key", get(handlers::storage_download))
        .route("/api/storage/file/*key", get(handlers::storage_file))
        .route("/api/storage/delete/*key", delete(handlers::storage_delete))
        .route("/api/storage/delete-batch", post(handlers::storage_delete_batch))
        .route("/api/storage/list/*prefix", get(handlers::storage_list))
        // Tree proxy
        .route(
            "/api/tree/nodes",
            post(handlers::create_node).get(handlers::list_nodes),
        )
        .route(
            "/api/tree/nodes/:id",
            get(handlers::get_node)
                .patch(handlers::rename_node)
                .delete(handlers::delete_node),
        )
        .route("/api/tree/nodes/:id/children", get(handlers::node_children))
        .route(
            "/api/tree/nodes/:id/files",
            get(handlers::node_files).post(handlers::register_node_file),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            super::auth::require_api_key,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

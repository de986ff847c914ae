//! HTTP handlers.

mod jobs;
mod storage;
mod tree;

pub use jobs::*;
pub use storage::*;
pub use tree::*;

use axum::response::IntoResponse;
use axum::Json;

/// Health check endpoint for container orchestration.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

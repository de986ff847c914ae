//! Tree proxy: node CRUD and node-file registration, passed through to the
//! metadata store.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use super::super::error::ApiError;
use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateNodeBody {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

/// POST /api/tree/nodes.
pub async fn create_node(
    State(state): State<AppState>,
    Json(body): Json<CreateNodeBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::InvalidInput("name must not be empty".to_string()));
    }
    let node = state
        .repos
        .nodes
        .create(
            body.parent_id.as_deref(),
            body.name.trim(),
            body.node_type.as_deref().unwrap_or("folder"),
        )
        .await?;
    Ok(Json(node))
}

#[derive(Debug, Deserialize)]
pub struct ListNodesParams {
    pub parent_id: Option<String>,
}

/// GET /api/tree/nodes: root nodes, or children of ?parent_id=.
pub async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<ListNodesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let nodes = state.repos.nodes.children(params.parent_id.as_deref()).await?;
    Ok(Json(nodes))
}

/// GET /api/tree/nodes/{id}.
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .repos
        .nodes
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("node {}", id)))?;
    Ok(Json(node))
}

/// GET /api/tree/nodes/{id}/children.
pub async fn node_children(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let nodes = state.repos.nodes.children(Some(&id)).await?;
    Ok(Json(nodes))
}

#[derive(Debug, Deserialize)]
pub struct RenameNodeBody {
    pub name: String,
}

/// PATCH /api/tree/nodes/{id}.
pub async fn rename_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameNodeBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::InvalidInput("name must not be empty".to_string()));
    }
    let node = state.repos.nodes.rename(&id, body.name.trim()).await?;
    Ok(Json(node))
}

/// DELETE /api/tree/nodes/{id}.
pub async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.repos.nodes.delete(&id).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("node {}", id)));
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /api/tree/nodes/{id}/files.
pub async fn node_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let files = state.repos.nodes.list_node_files(&id).await?;
    Ok(Json(files))
}

#[derive(Debug, Deserialize)]
pub struct RegisterFileBody {
    pub object_key: String,
    pub file_name: String,
    #[serde(default)]
    pub file_type: Option<String>,
}

/// POST /api/tree/nodes/{id}/files: idempotent registration keyed by
/// (node_id, object_key).
pub async fn register_node_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RegisterFileBody>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repos.nodes.get(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("node {}", id)));
    }
    let file = state
        .repos
        .nodes
        .register_node_file(
            &id,
            &body.object_key,
            &body.file_name,
            body.file_type.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(Json(file))
}

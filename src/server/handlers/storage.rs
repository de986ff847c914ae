//! Storage proxy endpoints, scoped to the configured store.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Redirect};
use axum::Json;
use serde::Deserialize;

use crate::storage::sign::verify_download;

use super::super::error::ApiError;
use super::super::AppState;

/// GET /api/storage/exists/{key}.
pub async fn storage_exists(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let exists = state.store.exists(&key).await?;
    Ok(Json(serde_json::json!({ "key": key, "exists": exists })))
}

/// POST /api/storage/upload/{key}: raw body upload.
pub async fn storage_upload(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            mime_guess::from_path(&key)
                .first_or_octet_stream()
                .to_string()
        });
    let size = body.len();
    state.store.upload(&key, body.to_vec(), &content_type).await?;
    Ok(Json(serde_json::json!({ "key": key, "size": size })))
}

#[derive(Debug, Deserialize)]
pub struct UploadTextBody {
    pub key: String,
    pub text: String,
}

/// POST /api/storage/upload-text.
pub async fn storage_upload_text(
    State(state): State<AppState>,
    Json(body): Json<UploadTextBody>,
) -> Result<impl IntoResponse, ApiError> {
    let size = body.text.len();
    state.store.upload_text(&body.key, &body.text).await?;
    Ok(Json(serde_json::json!({ "key": body.key, "size": size })))
}

/// GET /api/storage/download/{key}: redirect to a presigned URL.
pub async fn storage_download(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let url = state
        .store
        .presign_get(&key, state.settings.presign_expiry)
        .await?;
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
pub struct SignedParams {
    pub expires: i64,
    pub sig: String,
}

/// GET /api/storage/file/{key}: the filesystem store's presigned target.
/// Serves bytes only with a valid, unexpired signature.
pub async fn storage_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SignedParams>,
) -> Result<impl IntoResponse, ApiError> {
    if !verify_download(
        state.settings.signing_secret.as_bytes(),
        &key,
        params.expires,
        &params.sig,
    ) {
        return Err(ApiError::Unauthorized);
    }
    let bytes = state.store.download(&key).await?;
    let content_type = mime_guess::from_path(&key)
        .first_or_octet_stream()
        .to_string();
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

/// DELETE /api/storage/delete/{key}.
pub async fn storage_delete(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete(&key).await?;
    Ok(Json(serde_json::json!({ "key": key, "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteBatchBody {
    pub keys: Vec<String>,
}

/// POST /api/storage/delete-batch.
pub async fn storage_delete_batch(
    State(state): State<AppState>,
    Json(body): Json<DeleteBatchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.store.delete_batch(&body.keys).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

/// GET /api/storage/list/{prefix}.
pub async fn storage_list(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let keys = state.store.list_by_prefix(&prefix).await?;
    Ok(Json(serde_json::json!({ "prefix": prefix, "keys": keys })))
}

//! X-API-Key boundary check.
//!
//! When the server is configured with an API key, every path except /health
//! must present it. Comparison is exact; there are no scopes or tenants.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::error::ApiError;
use super::AppState;

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.api_key.as_deref() else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected) {
        next.run(request).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}

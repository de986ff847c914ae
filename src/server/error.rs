//! API error kinds and their HTTP mapping.
//!
//! Every boundary failure maps to a stable wire error kind; the body is
//! always `{"error": kind, "message": detail}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::broker::BrokerError;
use crate::repository::RepositoryError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    Unauthorized,
    NotFound(String),
    InvalidTransition(String),
    QueueFull { max: usize },
    NotReady(String),
    StorageUnavailable(String),
    MetadataUnavailable(String),
    BrokerUnavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::QueueFull { .. } => "queue_full",
            Self::NotReady(_) => "not_ready",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::MetadataUnavailable(_) => "metadata_unavailable",
            Self::BrokerUnavailable(_) => "broker_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::NotReady(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::StorageUnavailable(_)
            | Self::MetadataUnavailable(_)
            | Self::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::InvalidInput(m)
            | Self::NotFound(m)
            | Self::InvalidTransition(m)
            | Self::NotReady(m)
            | Self::StorageUnavailable(m)
            | Self::MetadataUnavailable(m)
            | Self::BrokerUnavailable(m)
            | Self::Internal(m) => m.clone(),
            Self::Unauthorized => "missing or invalid X-API-Key".to_string(),
            Self::QueueFull { max } => format!("queue is full (max {})", max),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.message(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(what) => ApiError::NotFound(what),
            RepositoryError::InvalidTransition { from, event } => {
                ApiError::InvalidTransition(format!("cannot {} a {} job", event, from))
            }
            RepositoryError::Database(e) => ApiError::MetadataUnavailable(e.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => ApiError::NotFound(key),
            StorageError::InvalidKey(key) => {
                ApiError::InvalidInput(format!("invalid object key: {}", key))
            }
            other => ApiError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Repository(inner) => inner.into(),
            BrokerError::Unavailable(m) => ApiError::BrokerUnavailable(m),
        }
    }
}

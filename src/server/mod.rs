//! HTTP API server for the OCR job system.
//!
//! The gateway owns admission control and the job lifecycle endpoints;
//! everything durable lives behind the repositories, the object store, and
//! the broker, all of which are constructed once and shared through
//! `AppState`.

mod auth;
mod error;
mod handlers;
mod routes;

pub use error::ApiError;
pub use routes::create_router;

use std::sync::Arc;

use tokio::sync::watch;

use crate::broker::Broker;
use crate::config::Settings;
use crate::repository::Repositories;
use crate::storage::ObjectStore;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub store: Arc<dyn ObjectStore>,
    pub broker: Arc<dyn Broker>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        repos: Repositories,
        store: Arc<dyn ObjectStore>,
        broker: Arc<dyn Broker>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            repos,
            store,
            broker,
            settings,
        }
    }
}

/// Start the API server; returns when the shutdown signal fires.
pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = state.settings.bind_addr();
    let app = create_router(state);

    tracing::info!("starting server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::broker::DbBroker;
    use crate::storage::FsObjectStore;

    async fn setup(mutate: impl FnOnce(&mut Settings)) -> (axum::Router, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::load(None).unwrap();
        settings.data_dir = dir.path().to_path_buf();
        settings.database_url = Some(format!("sqlite:{}", dir.path().join("test.db").display()));
        settings.storage_url = format!("file://{}", dir.path().join("objects").display());
        settings.api_key = None;
        mutate(&mut settings);
        let settings = Arc::new(settings);

        let repos = Repositories::connect(&settings.database_url())
            .await
            .unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(
            FsObjectStore::new(
                dir.path().join("objects").as_path(),
                settings.public_base_url.clone(),
                settings.signing_secret.as_bytes().to_vec(),
            )
            .unwrap(),
        );
        let broker: Arc<dyn Broker> = Arc::new(DbBroker::new(repos.clone(), 4));

        let app = create_router(AppState::new(repos, store, broker, settings));
        (app, dir)
    }

    fn multipart_job_body(boundary: &str, task_name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        let mut field = |name: &str, value: &str| {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    boundary, name, value
                )
                .as_bytes(),
            );
        };
        field("client_id", "client-1");
        field("document_id", "abc123");
        field("document_name", "doc.pdf");
        field("task_name", task_name);
        field("engine", "vision");
        field("text_model", "gpt-4o-mini");
        field("table_model", "gpt-4o-mini");
        field("image_model", "gpt-4o-mini");

        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"pdf\"; filename=\"doc.pdf\"\r\n\
                 Content-Type: application/pdf\r\n\r\n",
                boundary
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"%PDF-1.4 fake content\r\n");
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"blocks_file\"; \
                 filename=\"blocks.json\"\r\nContent-Type: application/json\r\n\r\n[]\r\n",
                boundary
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        body
    }

    async fn post_job(app: &axum::Router, task_name: &str) -> StatusCode {
        let boundary = "X-REMOCR-TEST-BOUNDARY";
        let request = Request::builder()
            .method("POST")
            .uri("/jobs")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(multipart_job_body(boundary, task_name)))
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (app, _dir) = setup(|s| s.api_key = Some("secret".to_string())).await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let (app, _dir) = setup(|s| s.api_key = Some("secret".to_string())).await;

        let denied = app
            .clone()
            .oneshot(Request::get("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::get("/queue")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_job_and_queue_depth() {
        let (app, _dir) = setup(|_| {}).await;

        assert_eq!(post_job(&app, "first").await, StatusCode::OK);

        let response = app
            .oneshot(Request::get("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["queued"], 1);
        assert_eq!(json["processing"], 0);
    }

    #[tokio::test]
    async fn test_backpressure_returns_queue_full() {
        let (app, _dir) = setup(|s| s.max_queue_size = 2).await;

        assert_eq!(post_job(&app, "j1").await, StatusCode::OK);
        assert_eq!(post_job(&app, "j2").await, StatusCode::OK);
        // Third create bounces with 429 queue_full.
        assert_eq!(post_job(&app, "j3").await, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_invalid_pdf_rejected() {
        let (app, _dir) = setup(|_| {}).await;
        let boundary = "X-REMOCR-TEST-BOUNDARY";
        // Corrupt the PDF magic so content sniffing rejects it.
        let body = String::from_utf8_lossy(&multipart_job_body(boundary, "bad"))
            .replace("%PDF-1.4", "NOT-A-PDF")
            .into_bytes();
        let request = Request::builder()
            .method("POST")
            .uri("/jobs")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let (app, _dir) = setup(|_| {}).await;
        let response = app
            .oneshot(Request::get("/jobs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_conflict() {
        let (app, _dir) = setup(|_| {}).await;
        assert_eq!(post_job(&app, "j1").await, StatusCode::OK);

        // Find the job id via the list endpoint.
        let response = app
            .clone()
            .oneshot(Request::get("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let jobs: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let id = jobs[0]["id"].as_str().unwrap().to_string();

        // Resuming a queued job is not a legal transition.
        let response = app
            .oneshot(
                Request::post(format!("/jobs/{}/resume", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}

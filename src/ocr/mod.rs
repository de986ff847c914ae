//! Vision backend dispatcher.
//!
//! Two concrete backends implement the same capability contract,
//! `recognize(image, prompt, model, json_mode) -> text`:
//!
//! - `VisionBackend`: an API-keyed chat-style vision provider, one request
//!   per crop/strip with a base64 image payload.
//! - `SegmentBackend`: a segmentation+OCR service that takes a single-page
//!   PDF, is polled for completion, and returns markdown.
//!
//! Every outbound call acquires the process-global request ceiling and the
//! backend's rate limiter before touching the network.

pub mod pdf_utils;
pub mod prompts;
mod segment;
mod vision;

pub use segment::SegmentBackend;
pub use vision::VisionBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Settings;
use crate::models::EngineKind;
use crate::rate_limit::{RateLimitError, RateLimiters};

/// How long a pipeline worker will wait on the limiter before giving up on
/// the current block.
const LIMITER_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),
    #[error("recognition failed: {0}")]
    Failed(String),
    #[error("rate limited by backend after retries")]
    RateLimited,
    #[error("bad response from backend: {0}")]
    BadResponse(String),
    #[error(transparent)]
    Limiter(#[from] RateLimitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl OcrError {
    /// Whether a broker-level retry of the whole job could plausibly help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OcrError::RateLimited | OcrError::Http(_) | OcrError::Limiter(_)
        )
    }
}

/// Capability contract every vision backend implements.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Whether credentials/endpoint are configured.
    fn is_available(&self) -> bool;

    /// What is missing when `is_available` is false.
    fn availability_hint(&self) -> String;

    /// Limiter policy name for a model id (providers may differ per model).
    fn policy_name(&self, model: &str) -> String;

    async fn recognize(
        &self,
        image: &[u8],
        prompt: &str,
        model: &str,
        json_mode: bool,
    ) -> Result<String, OcrError>;
}

/// Routes recognition calls to the engine-selected backend under rate
/// limits.
pub struct Dispatcher {
    vision: VisionBackend,
    segment: SegmentBackend,
    limiters: Arc<RateLimiters>,
}

impl Dispatcher {
    pub fn new(settings: &Settings, limiters: Arc<RateLimiters>) -> Self {
        Self {
            vision: VisionBackend::new(
                settings.vision_api_base.clone(),
                settings.vision_api_key.clone(),
            ),
            segment: SegmentBackend::new(
                settings.segment_api_base.clone(),
                settings.segment_api_key.clone(),
            ),
            limiters,
        }
    }

    pub fn backend(&self, engine: EngineKind) -> &dyn OcrBackend {
        match engine {
            EngineKind::Vision => &self.vision,
            EngineKind::Segment => &self.segment,
        }
    }

    /// Recognize one image. JSON mode is used when requested explicitly or
    /// when the prompt itself asks for JSON output.
    pub async fn recognize(
        &self,
        engine: EngineKind,
        image: &[u8],
        prompt: &str,
        model: &str,
        json_mode: bool,
    ) -> Result<String, OcrError> {
        let backend = self.backend(engine);
        if !backend.is_available() {
            return Err(OcrError::BackendNotAvailable(backend.availability_hint()));
        }
        let json_mode = json_mode || prompts::wants_json(prompt);

        let _global = self.limiters.acquire_global().await?;
        let limiter = self.limiters.get(&backend.policy_name(model));
        let _permit = limiter.acquire(LIMITER_ACQUIRE_TIMEOUT).await?;

        backend.recognize(image, prompt, model, json_mode).await
    }
}

//! Segmentation+OCR provider backend.
//!
//! The provider only accepts PDFs: the crop image is wrapped into a
//! single-page PDF, submitted, and its status endpoint polled until the
//! markdown result is ready.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::models::EngineKind;

use super::{pdf_utils, OcrBackend, OcrError};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 150;

pub struct SegmentBackend {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl SegmentBackend {
    pub fn new(api_base: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }
}

#[async_trait]
impl OcrBackend for SegmentBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Segment
    }

    fn is_available(&self) -> bool {
        !self.api_base.is_empty()
    }

    fn availability_hint(&self) -> String {
        if self.api_base.is_empty() {
            "REMOCR_SEGMENT_API_BASE is not set".to_string()
        } else {
            format!("segment backend ready at {}", self.api_base)
        }
    }

    fn policy_name(&self, _model: &str) -> String {
        "segment".to_string()
    }

    async fn recognize(
        &self,
        image: &[u8],
        _prompt: &str,
        model: &str,
        _json_mode: bool,
    ) -> Result<String, OcrError> {
        let pdf = pdf_utils::image_to_pdf(image)
            .map_err(|e| OcrError::Failed(format!("pdf wrapping failed: {}", e)))?;

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(pdf)
                    .file_name("crop.pdf")
                    .mime_str("application/pdf")
                    .map_err(|e| OcrError::BadResponse(e.to_string()))?,
            )
            .text("output_format", "markdown")
            .text("model", model.to_string());

        let submit: SubmitResponse = self
            .authorized(self.client.post(format!("{}/api/convert", self.api_base)))
            .multipart(form)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| match e.status() {
                Some(status) if status.as_u16() == 429 => OcrError::RateLimited,
                _ => OcrError::Http(e),
            })?
            .json()
            .await
            .map_err(|e| OcrError::BadResponse(e.to_string()))?;

        for _ in 0..MAX_POLLS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let status: StatusResponse = self
                .authorized(self.client.get(format!(
                    "{}/api/convert/{}",
                    self.api_base, submit.request_id
                )))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .map_err(|e| OcrError::BadResponse(e.to_string()))?;

            match status.status.as_str() {
                "complete" => {
                    return status.markdown.ok_or_else(|| {
                        OcrError::BadResponse("complete response without markdown".to_string())
                    })
                }
                "failed" => {
                    return Err(OcrError::Failed(
                        status.error.unwrap_or_else(|| "conversion failed".to_string()),
                    ))
                }
                _ => continue,
            }
        }
        Err(OcrError::Failed(format!(
            "segment request {} did not complete in time",
            submit.request_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_name_is_fixed() {
        let backend = SegmentBackend::new("http://localhost:8501".to_string(), None);
        assert_eq!(backend.policy_name("any-model"), "segment");
    }

    #[test]
    fn test_available_without_key() {
        // The segment provider may be deployed keyless inside the network.
        let backend = SegmentBackend::new("http://localhost:8501".to_string(), None);
        assert!(backend.is_available());
    }
}

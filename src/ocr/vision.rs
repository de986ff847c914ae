//! API-keyed vision provider backend.
//!
//! Speaks the chat-completions shape most hosted vision models expose: a
//! system message, a user message with text plus a base64 data-URL image,
//! optional JSON response format. Transient failures retry with exponential
//! backoff (2^k seconds, three attempts); 4xx other than 429 are terminal.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::models::EngineKind;
use crate::rate_limit::backoff_delay;

use super::{prompts, OcrBackend, OcrError};

const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct VisionBackend {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: MessageContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

impl VisionBackend {
    pub fn new(api_base: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn build_request<'a>(
        &self,
        model: &'a str,
        prompt: &'a str,
        image: &[u8],
        json_mode: bool,
    ) -> ChatRequest<'a> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(prompts::SYSTEM_PROMPT),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: prompt.to_string(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: format!("data:image/png;base64,{}", encoded),
                            },
                        },
                    ]),
                },
            ],
            temperature: 0.0,
            response_format: json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        }
    }
}

#[async_trait]
impl OcrBackend for VisionBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Vision
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn availability_hint(&self) -> String {
        if self.api_key.is_none() {
            "REMOCR_VISION_API_KEY is not set".to_string()
        } else {
            format!("vision backend ready at {}", self.api_base)
        }
    }

    /// Models namespaced as `provider/model` get a per-provider limiter;
    /// everything else shares the backend policy.
    fn policy_name(&self, model: &str) -> String {
        match model.split_once('/') {
            Some((provider, _)) if !provider.is_empty() => provider.to_string(),
            _ => "vision".to_string(),
        }
    }

    async fn recognize(
        &self,
        image: &[u8],
        prompt: &str,
        model: &str,
        json_mode: bool,
    ) -> Result<String, OcrError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| OcrError::BackendNotAvailable(self.availability_hint()))?;
        let model = if model.is_empty() { DEFAULT_MODEL } else { model };
        let request = self.build_request(model, prompt, image, json_mode);
        let url = format!("{}/chat/completions", self.api_base);

        let mut last_error = OcrError::RateLimited;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let response = match self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("vision request failed (attempt {}): {}", attempt + 1, e);
                    last_error = OcrError::Http(e);
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                tracing::debug!(
                    "vision backend returned {} (attempt {})",
                    status,
                    attempt + 1
                );
                last_error = if status.as_u16() == 429 {
                    OcrError::RateLimited
                } else {
                    OcrError::Failed(format!("server error {}", status))
                };
                continue;
            }
            if status.is_client_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(OcrError::Failed(format!(
                    "vision backend rejected request ({}): {}",
                    status,
                    body.chars().take(512).collect::<String>()
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| OcrError::BadResponse(e.to_string()))?;
            if let Some(error) = parsed.error {
                return Err(OcrError::Failed(error.message));
            }
            return parsed
                .choices
                .and_then(|mut choices| {
                    if choices.is_empty() {
                        None
                    } else {
                        choices.remove(0).message.content
                    }
                })
                .ok_or_else(|| OcrError::BadResponse("response had no content".to_string()));
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_requires_key() {
        let backend = VisionBackend::new("https://api.example.com/v1".to_string(), None);
        assert!(!backend.is_available());
        let backend = VisionBackend::new(
            "https://api.example.com/v1".to_string(),
            Some("key".to_string()),
        );
        assert!(backend.is_available());
    }

    #[test]
    fn test_policy_name_per_provider() {
        let backend = VisionBackend::new("https://api.example.com/v1".to_string(), None);
        assert_eq!(backend.policy_name("acme/vision-large"), "acme");
        assert_eq!(backend.policy_name("gpt-4o-mini"), "vision");
        assert_eq!(backend.policy_name(""), "vision");
    }

    #[test]
    fn test_request_serialization_shape() {
        let backend = VisionBackend::new(
            "https://api.example.com/v1".to_string(),
            Some("key".to_string()),
        );
        let request = backend.build_request("m", "read this JSON", b"\x89PNG", true);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"][0]["type"], "text");
        assert_eq!(json["messages"][1]["content"][1]["type"], "image_url");
        assert!(json["messages"][1]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(json["response_format"]["type"], "json_object");
    }
}

//! Google Gemini provider using the public `generateContent` endpoint with an
//! API key passed as a query parameter.

use crate::providers::traits::{ChatMessage, Provider, ProviderError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const PROVIDER_NAME: &str = "gemini";
const MAX_OUTPUT_TOKENS: u32 = 8192;

pub struct GeminiProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GeminiProvider {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToString::to_string),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: super::http_client(PROVIDER_NAME),
        }
    }

    fn format_model_name(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        }
    }

    fn generate_content_url(&self, model: &str) -> String {
        format!(
            "{}/{}:generateContent",
            self.base_url,
            Self::format_model_name(model)
        )
    }

    fn build_request(messages: &[ChatMessage], temperature: f64) -> GenerateContentRequest {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut contents: Vec<Content> = Vec::new();

        for msg in messages {
            let role = match msg.role.as_str() {
                "system" => {
                    system_parts.push(&msg.content);
                    continue;
                }
                // Gemini uses "model" in place of "assistant".
                "assistant" => "model",
                _ => "user",
            };
            contents.push(Content {
                role: Some(role.to_string()),
                parts: vec![Part {
                    text: msg.content.clone(),
                }],
            });
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(Content {
                role: None,
                parts: vec![Part {
                    text: system_parts.join("\n\n"),
                }],
            })
        };

        GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        }
    }

    fn parse_response(body: &str) -> Result<String, ProviderError> {
        let response: GenerateContentResponse =
            serde_json::from_str(body).map_err(|e| ProviderError::malformed(PROVIDER_NAME, e))?;

        if let Some(error) = response.error {
            return Err(ProviderError::Api {
                provider: PROVIDER_NAME.into(),
                status: 200,
                message: super::sanitize_api_error(&error.message),
            });
        }

        let text = response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::empty(PROVIDER_NAME));
        }
        Ok(text)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
    ) -> Result<String, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredential {
                provider: PROVIDER_NAME.into(),
            })?;

        let request = Self::build_request(messages, temperature);
        let response = self
            .client
            .post(self.generate_content_url(model))
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER_NAME, &e))?;

        if !response.status().is_success() {
            return Err(super::api_error(PROVIDER_NAME, response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER_NAME, &e))?;
        Self::parse_response(&body)
    }

    async fn warmup(&self) -> Result<(), ProviderError> {
        if let Some(api_key) = self.api_key.as_deref() {
            self.client
                .get(format!("{}/models", self.base_url))
                .query(&[("key", api_key)])
                .send()
                .await
                .map_err(|e| ProviderError::transport(PROVIDER_NAME, &e))?;
        }
        Ok(())
    }
}

use crate::providers::traits::{ChatMessage, Provider, ProviderError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const PROVIDER_NAME: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    credential: Option<String>,
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    temperature: f64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, credential: Option<&str>) -> Self {
        Self {
            credential: credential
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToString::to_string),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: super::http_client(PROVIDER_NAME),
        }
    }

    /// Split the shared history into Anthropic's top-level `system` field and
    /// an alternating user/assistant list that starts with a user turn.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Message>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut native: Vec<Message> = Vec::new();

        for msg in messages {
            let role = match msg.role.as_str() {
                "system" => {
                    system_parts.push(&msg.content);
                    continue;
                }
                "assistant" => "assistant",
                _ => "user",
            };

            if native.is_empty() && role == "assistant" {
                continue;
            }

            match native.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&msg.content);
                }
                _ => native.push(Message {
                    role: role.to_string(),
                    content: msg.content.clone(),
                }),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, native)
    }

    fn parse_text_response(response: ChatResponse) -> Result<String, ProviderError> {
        let text = response
            .content
            .into_iter()
            .filter(|c| c.kind == "text")
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(ProviderError::empty(PROVIDER_NAME));
        }
        Ok(text)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
    ) -> Result<String, ProviderError> {
        let credential =
            self.credential
                .as_deref()
                .ok_or_else(|| ProviderError::MissingCredential {
                    provider: PROVIDER_NAME.into(),
                })?;

        let (system, messages) = Self::convert_messages(messages);
        let request = ChatRequest {
            model: model.to_string(),
            max_tokens: MAX_TOKENS,
            system,
            messages,
            temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", credential)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
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
        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::malformed(PROVIDER_NAME, e))?;
        Self::parse_text_response(chat_response)
    }

    async fn warmup(&self) -> Result<(), ProviderError> {
        if let Some(credential) = self.credential.as_deref() {
            self.client
                .head(&self.base_url)
                .header("x-api-key", credential)
                .header("anthropic-version", API_VERSION)
                .send()
                .await
                .map_err(|e| ProviderError::transport(PROVIDER_NAME, &e))?;
        }
        Ok(())
    }
}

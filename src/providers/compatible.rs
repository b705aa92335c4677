//! Generic OpenAI-compatible provider.
//! Most LLM APIs follow the same `/v1/chat/completions` format.
//! This module provides a single implementation that works for all of them.

use crate::providers::traits::{ChatMessage, Provider, ProviderError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

/// A provider that speaks the OpenAI-compatible chat completions API.
/// Used by: `OpenAI`, Groq, `OpenRouter`, `DeepSeek`, Mistral, Together.
pub struct OpenAiCompatibleProvider {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) credential: Option<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ApiChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning models may return their output in `reasoning_content`
    /// instead of `content`.
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl ResponseMessage {
    fn effective_content(self) -> Option<String> {
        match self.content {
            Some(c) if !c.trim().is_empty() => Some(c),
            _ => self.reasoning_content.filter(|c| !c.trim().is_empty()),
        }
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, base_url: &str, credential: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credential: credential.map(ToString::to_string),
            client: super::http_client(name),
        }
    }

    fn chat_completions_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    /// Every compatible backend takes `Authorization: Bearer <key>`.
    fn apply_auth_header(req: RequestBuilder, credential: &str) -> RequestBuilder {
        req.header("Authorization", format!("Bearer {credential}"))
    }
}

fn parse_chat_response_body(provider: &str, body: &str) -> Result<String, ProviderError> {
    let parsed: ApiChatResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::malformed(provider, e))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.effective_content())
        .ok_or_else(|| ProviderError::empty(provider))
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
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
                    provider: self.name.clone(),
                })?;

        let request = ApiChatRequest {
            model: model.to_string(),
            messages: messages
                .iter()
                .map(|m| Message {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature,
            stream: false,
        };

        let response = Self::apply_auth_header(
            self.client.post(self.chat_completions_url()).json(&request),
            credential,
        )
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.name, &e))?;

        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::transport(&self.name, &e))?;
        parse_chat_response_body(&self.name, &body)
    }

    async fn warmup(&self) -> Result<(), ProviderError> {
        if let Some(credential) = self.credential.as_deref() {
            let url = format!("{}/models", self.base_url);
            Self::apply_auth_header(self.client.get(&url), credential)
                .send()
                .await
                .map_err(|e| ProviderError::transport(&self.name, &e))?;
        }
        Ok(())
    }
}

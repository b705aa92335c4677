use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Failure of a single provider invocation.
///
/// Every variant is treated the same by the fallback engine (log and advance);
/// the distinction only drives retry eligibility and log labels.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} rate limited: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider} rejected credentials: {message}")]
    Authentication { provider: String, message: String },

    #[error("{provider} timed out: {message}")]
    Timeout { provider: String, message: String },

    #[error("{provider} transport error: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider} returned a malformed response: {message}")]
    MalformedResponse { provider: String, message: String },

    #[error("{provider} returned an empty response")]
    EmptyResponse { provider: String },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider} API key not set")]
    MissingCredential { provider: String },
}

impl ProviderError {
    /// Map a non-success HTTP status to the matching variant.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let provider = provider.to_string();
        let message = super::sanitize_api_error(body);
        match status {
            401 | 403 => Self::Authentication { provider, message },
            429 => Self::RateLimited { provider, message },
            408 | 504 => Self::Timeout { provider, message },
            _ => Self::Api {
                provider,
                status,
                message,
            },
        }
    }

    pub fn transport(provider: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                provider: provider.to_string(),
                message: "HTTP request timed out".into(),
            };
        }
        Self::Transport {
            provider: provider.to_string(),
            message: super::sanitize_api_error(&err.to_string()),
        }
    }

    pub fn malformed(provider: &str, message: impl std::fmt::Display) -> Self {
        Self::MalformedResponse {
            provider: provider.to_string(),
            message: super::sanitize_api_error(&message.to_string()),
        }
    }

    pub fn empty(provider: &str) -> Self {
        Self::EmptyResponse {
            provider: provider.to_string(),
        }
    }

    /// Short stable label for structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Authentication { .. } => "auth",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::EmptyResponse { .. } => "empty_response",
            Self::Api { .. } => "api_error",
            Self::MissingCredential { .. } => "missing_credential",
        }
    }

    /// Whether a second attempt against the same provider can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout { .. }
            | Self::Transport { .. }
            | Self::EmptyResponse { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Authentication { .. }
            | Self::MalformedResponse { .. }
            | Self::MissingCredential { .. } => false,
        }
    }
}

/// Uniform chat-completion capability implemented once per vendor.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Canonical provider name used in logs and broadcast headers.
    fn name(&self) -> &str;

    /// Multi-turn completion over the full ordered history.
    async fn chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
    ) -> Result<String, ProviderError>;

    /// Warm up the HTTP connection pool (TLS handshake, DNS).
    /// Default implementation is a no-op.
    async fn warmup(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

//! Provider subsystem for model inference backends.
//!
//! Each backend implements the [`Provider`] trait defined in [`traits`] and is
//! constructed through the static registry in this module: a [`ProviderKind`]
//! maps to exactly one adapter type, and [`build_descriptors`] turns the
//! configured priority list into the ordered [`ProviderDescriptor`] set used by
//! the [`FallbackEngine`](fallback::FallbackEngine). Providers without a
//! resolvable credential are omitted at startup instead of failing at call time.
//!
//! # Extension
//!
//! To add a backend, implement [`Provider`] in a new submodule, add a
//! [`ProviderKind`] variant, and wire it into [`create_provider`].

pub mod anthropic;
pub mod compatible;
pub mod fallback;
pub mod gemini;
pub mod traits;

pub use traits::{ChatMessage, Provider, ProviderError};

pub use fallback::{CompletionResult, FallbackEngine, FallbackOptions, ProviderDescriptor};

use crate::config::{Config, ConfigError};
use anthropic::AnthropicProvider;
use compatible::OpenAiCompatibleProvider;
use gemini::GeminiProvider;
use std::fmt;
use std::sync::Arc;

const MAX_API_ERROR_CHARS: usize = 200;

/// Every backend the registry knows how to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Groq,
    OpenRouter,
    DeepSeek,
    Mistral,
    Together,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    /// Resolve a user-facing key or alias.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" | "chatgpt" => Some(Self::OpenAi),
            "groq" => Some(Self::Groq),
            "openrouter" => Some(Self::OpenRouter),
            "deepseek" => Some(Self::DeepSeek),
            "mistral" => Some(Self::Mistral),
            "together" | "together-ai" => Some(Self::Together),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" | "google-gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Groq => "groq",
            Self::OpenRouter => "openrouter",
            Self::DeepSeek => "deepseek",
            Self::Mistral => "mistral",
            Self::Together => "together",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    /// Environment variables consulted for the API key, in order.
    pub fn credential_env_vars(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["OPENAI_API_KEY"],
            Self::Groq => &["GROQ_API_KEY"],
            Self::OpenRouter => &["OPENROUTER_API_KEY"],
            Self::DeepSeek => &["DEEPSEEK_API_KEY"],
            Self::Mistral => &["MISTRAL_API_KEY"],
            Self::Together => &["TOGETHER_API_KEY"],
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Groq => "llama-3.3-70b-versatile",
            Self::OpenRouter => "openrouter/auto",
            Self::DeepSeek => "deepseek-chat",
            Self::Mistral => "mistral-small-latest",
            Self::Together => "meta-llama/Llama-3.3-70B-Instruct-Turbo",
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::Gemini => "gemini-2.0-flash",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Mistral => "https://api.mistral.ai/v1",
            Self::Together => "https://api.together.xyz/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Construct the adapter for `kind`. `base_url` overrides the vendor endpoint
/// (used for self-hosted gateways and tests).
pub fn create_provider(
    kind: ProviderKind,
    credential: &str,
    base_url: Option<&str>,
) -> Box<dyn Provider> {
    let base_url = base_url.unwrap_or_else(|| kind.default_base_url());
    match kind {
        ProviderKind::Anthropic => Box::new(AnthropicProvider::new(base_url, Some(credential))),
        ProviderKind::Gemini => Box::new(GeminiProvider::new(base_url, Some(credential))),
        ProviderKind::OpenAi
        | ProviderKind::Groq
        | ProviderKind::OpenRouter
        | ProviderKind::DeepSeek
        | ProviderKind::Mistral
        | ProviderKind::Together => Box::new(OpenAiCompatibleProvider::new(
            kind.key(),
            base_url,
            Some(credential),
        )),
    }
}

/// Resolve API key for a provider from config and environment variables.
///
/// Resolution order:
/// 1. Explicit `api_key` in the provider's config entry (trimmed, filtered if empty)
/// 2. Provider-specific environment variables (e.g. `GROQ_API_KEY`)
pub fn resolve_provider_credential(
    kind: ProviderKind,
    credential_override: Option<&str>,
) -> Option<String> {
    if let Some(raw) = credential_override {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    for env_var in kind.credential_env_vars() {
        if let Ok(value) = std::env::var(env_var) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    None
}

/// Summary row used by `duobot providers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    pub kind: ProviderKind,
    pub model: String,
    pub has_credential: bool,
}

/// Parse the configured priority list, applying `default_provider` promotion.
pub fn priority_order(config: &Config) -> Result<Vec<ProviderKind>, ConfigError> {
    let mut order: Vec<ProviderKind> = Vec::new();

    let mut push = |name: &str| -> Result<(), ConfigError> {
        let kind =
            ProviderKind::parse(name).ok_or_else(|| ConfigError::UnknownProvider(name.into()))?;
        if !order.contains(&kind) {
            order.push(kind);
        }
        Ok(())
    };

    if let Some(default) = config.default_provider.as_deref() {
        push(default)?;
    }
    for name in &config.reliability.providers {
        push(name)?;
    }

    Ok(order)
}

fn model_for(config: &Config, kind: ProviderKind, is_primary: bool) -> String {
    let entry = config.providers.get(kind.key());
    if let Some(model) = entry.and_then(|e| e.model.as_deref()) {
        if !model.trim().is_empty() {
            return model.trim().to_string();
        }
    }
    if is_primary {
        if let Some(model) = config.default_model.as_deref() {
            if !model.trim().is_empty() {
                return model.trim().to_string();
            }
        }
    }
    kind.default_model().to_string()
}

/// Describe every provider in the priority list, credentialed or not.
pub fn provider_statuses(config: &Config) -> Result<Vec<ProviderStatus>, ConfigError> {
    let order = priority_order(config)?;
    Ok(order
        .iter()
        .enumerate()
        .map(|(index, kind)| {
            let entry = config.providers.get(kind.key());
            ProviderStatus {
                kind: *kind,
                model: model_for(config, *kind, index == 0),
                has_credential: resolve_provider_credential(
                    *kind,
                    entry.and_then(|e| e.api_key.as_deref()),
                )
                .is_some(),
            }
        })
        .collect())
}

/// Build the immutable, priority-ordered descriptor list.
///
/// Providers whose credential cannot be resolved are skipped; this never fails
/// for a missing key, only for an unknown provider name.
pub fn build_descriptors(config: &Config) -> Result<Vec<ProviderDescriptor>, ConfigError> {
    let order = priority_order(config)?;
    let mut descriptors = Vec::with_capacity(order.len());

    for (index, kind) in order.iter().enumerate() {
        let entry = config.providers.get(kind.key());
        let Some(credential) =
            resolve_provider_credential(*kind, entry.and_then(|e| e.api_key.as_deref()))
        else {
            tracing::info!(
                provider = kind.key(),
                "No credential configured; provider disabled"
            );
            continue;
        };

        let base_url = entry.and_then(|e| e.base_url.as_deref());
        let provider: Arc<dyn Provider> = Arc::from(create_provider(*kind, &credential, base_url));
        descriptors.push(ProviderDescriptor {
            name: kind.key().to_string(),
            priority: descriptors.len(),
            model: model_for(config, *kind, index == 0),
            provider,
        });
    }

    Ok(descriptors)
}

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub known secret-like token prefixes from provider error strings.
///
/// Redacts tokens with prefixes like `sk-`, `gsk_`, `AIza`, and bearer headers.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [(&str, usize); 10] = [
        ("sk-", 1),
        ("gsk_", 1),
        ("AIza", 1),
        ("\"api_key\":\"", 8),
        ("\"token\":\"", 8),
        ("api_key=", 8),
        ("key=", 8),
        ("token=", 8),
        ("Bearer ", 16),
        ("bearer ", 16),
    ];

    let mut scrubbed = input.to_string();

    for (prefix, min_len) in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);
            let token_len = end.saturating_sub(content_start);

            // Bare prefixes like "sk-" should not stop future scans.
            if token_len < min_len {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize API error text by scrubbing secrets, collapsing whitespace and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    crate::util::truncate_with_ellipsis(&scrubbed, MAX_API_ERROR_CHARS)
}

/// Build a sanitized provider error from a failed HTTP response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    ProviderError::from_status(provider, status, &body)
}

/// Shared HTTP client builder for provider adapters.
pub(crate) fn http_client(provider: &str) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap_or_else(|error| {
            tracing::warn!(provider, "Failed to build provider HTTP client: {error}");
            reqwest::Client::new()
        })
}

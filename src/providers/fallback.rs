use super::traits::{ChatMessage, Provider, ProviderError};
use crate::config::Config;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, every AI provider is busy right now. Please try again in a moment.";

const MAX_BACKOFF_MS: u64 = 10_000;

/// One entry of the immutable, priority-ordered provider set.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Ascending; lower is tried first.
    pub priority: usize,
    pub model: String,
    pub provider: Arc<dyn Provider>,
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Upper bound on a single provider invocation.
    pub timeout: Duration,
    /// Extra attempts against the same provider for retryable errors.
    pub provider_retries: u32,
    pub retry_backoff_ms: u64,
    pub temperature: f64,
    /// User-facing text returned when every provider failed.
    pub fallback_message: String,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            provider_retries: 0,
            retry_backoff_ms: 500,
            temperature: 0.7,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

impl FallbackOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.reliability.provider_timeout_secs.max(1)),
            provider_retries: config.reliability.provider_retries,
            retry_backoff_ms: config.reliability.provider_backoff_ms,
            temperature: config.default_temperature,
            fallback_message: config.reliability.fallback_message.clone(),
        }
    }
}

/// Outcome of one request. Exhaustion is a normal value, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    /// Empty when no provider succeeded.
    pub provider_name: String,
    pub text: String,
    pub succeeded: bool,
}

impl CompletionResult {
    fn success(provider_name: &str, text: String) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            text,
            succeeded: true,
        }
    }

    fn exhausted(message: &str) -> Self {
        Self {
            provider_name: String::new(),
            text: message.to_string(),
            succeeded: false,
        }
    }
}

fn push_failure(
    failures: &mut Vec<String>,
    provider_name: &str,
    attempt: u32,
    max_attempts: u32,
    err: &ProviderError,
) {
    failures.push(format!(
        "provider={provider_name} attempt {attempt}/{max_attempts}: {}; error={err}",
        err.reason()
    ));
}

// ── Fallback Engine ───────────────────────────────────────────────────────
// Outer loop: descriptors in ascending priority, stopping at first success.
// Inner loop: bounded retries of the same provider for retryable errors only.
// Every invocation runs under its own timeout; an expired call counts as a
// provider failure and never propagates cancellation to the caller.

pub struct FallbackEngine {
    descriptors: Vec<ProviderDescriptor>,
    options: FallbackOptions,
}

impl FallbackEngine {
    pub fn new(mut descriptors: Vec<ProviderDescriptor>, options: FallbackOptions) -> Self {
        descriptors.sort_by_key(|d| d.priority);
        Self {
            descriptors,
            options,
        }
    }

    pub fn descriptors(&self) -> &[ProviderDescriptor] {
        &self.descriptors
    }

    pub fn options(&self) -> &FallbackOptions {
        &self.options
    }

    /// Pre-warm every provider's connection pool. Failures are only logged.
    pub async fn warmup(&self) {
        for descriptor in &self.descriptors {
            if let Err(e) = descriptor.provider.warmup().await {
                tracing::warn!(provider = %descriptor.name, error = %e, "Provider warmup failed");
            }
        }
    }

    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        let call = descriptor.provider.chat_with_history(
            messages,
            &descriptor.model,
            self.options.temperature,
        );

        match tokio::time::timeout(self.options.timeout, call).await {
            Ok(Ok(text)) if text.trim().is_empty() => Err(ProviderError::empty(&descriptor.name)),
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                provider: descriptor.name.clone(),
                message: format!("no response within {}s", self.options.timeout.as_secs()),
            }),
        }
    }

    async fn invoke_with_retries(
        &self,
        descriptor: &ProviderDescriptor,
        messages: &[ChatMessage],
        failures: &mut Vec<String>,
    ) -> Result<String, ProviderError> {
        let max_attempts = self.options.provider_retries + 1;
        let mut backoff_ms = self.options.retry_backoff_ms;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.invoke(descriptor, messages).await {
                Ok(text) => {
                    if attempt > 1 {
                        tracing::info!(
                            provider = %descriptor.name,
                            attempt,
                            "Provider recovered after retry"
                        );
                    }
                    return Ok(text);
                }
                Err(e) => {
                    push_failure(failures, &descriptor.name, attempt, max_attempts, &e);

                    if attempt >= max_attempts || !e.is_retryable() {
                        tracing::warn!(
                            provider = %descriptor.name,
                            model = %descriptor.model,
                            reason = e.reason(),
                            error = %e,
                            "Provider failed, moving on"
                        );
                        return Err(e);
                    }

                    tracing::warn!(
                        provider = %descriptor.name,
                        attempt,
                        backoff_ms,
                        reason = e.reason(),
                        error = %e,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    /// First-success completion across providers in priority order.
    ///
    /// Never fails: total exhaustion yields `succeeded = false` with the
    /// configured fallback message. The history is not mutated.
    pub async fn complete(&self, messages: &[ChatMessage]) -> CompletionResult {
        if messages.is_empty() || self.descriptors.is_empty() {
            tracing::error!(
                providers = self.descriptors.len(),
                turns = messages.len(),
                "Nothing to complete: no providers or empty history"
            );
            return CompletionResult::exhausted(&self.options.fallback_message);
        }

        let mut failures = Vec::new();
        for (index, descriptor) in self.descriptors.iter().enumerate() {
            if let Ok(text) = self
                .invoke_with_retries(descriptor, messages, &mut failures)
                .await
            {
                if index > 0 {
                    tracing::info!(
                        provider = %descriptor.name,
                        skipped = index,
                        "Provider recovered (failover)"
                    );
                }
                return CompletionResult::success(&descriptor.name, text);
            }
        }

        tracing::error!(
            "All providers failed. Attempts:\n{}",
            failures.join("\n")
        );
        CompletionResult::exhausted(&self.options.fallback_message)
    }

    /// Query every provider concurrently; results are returned in priority
    /// order once all have settled.
    pub async fn broadcast(&self, messages: &[ChatMessage]) -> Vec<(String, CompletionResult)> {
        if messages.is_empty() {
            return Vec::new();
        }

        let calls = self.descriptors.iter().map(|descriptor| async move {
            let mut failures = Vec::new();
            let result = match self
                .invoke_with_retries(descriptor, messages, &mut failures)
                .await
            {
                Ok(text) => CompletionResult::success(&descriptor.name, text),
                Err(e) => CompletionResult {
                    provider_name: descriptor.name.clone(),
                    text: format!("⚠️ {} failed: {}", descriptor.name, e.reason()),
                    succeeded: false,
                },
            };
            (descriptor.name.clone(), result)
        });

        join_all(calls).await
    }
}

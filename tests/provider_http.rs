//! Provider adapters against mock HTTP servers.
//!
//! Each adapter is built through `create_provider` with a base URL override,
//! so the request shape, auth header and response parsing are exercised
//! exactly as in production.

use duobot::config::{Config, ProviderEntryConfig};
use duobot::providers::{
    build_descriptors, create_provider, ChatMessage, FallbackEngine, FallbackOptions,
    ProviderError, ProviderKind,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn history() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("Be brief."),
        ChatMessage::user("hi"),
        ChatMessage::assistant("hello"),
        ChatMessage::user("how are you?"),
    ]
}

fn openai_reply(text: &str) -> serde_json::Value {
    json!({
        "choices": [{ "message": { "role": "assistant", "content": text } }]
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-compatible adapter
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn compatible_sends_bearer_and_full_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer gsk-test"))
        .and(body_partial_json(json!({
            "model": "llama-3.3-70b-versatile",
            "messages": [
                { "role": "system", "content": "Be brief." },
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" },
                { "role": "user", "content": "how are you?" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("fine")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::Groq, "gsk-test", Some(&server.uri()));
    let text = provider
        .chat_with_history(&history(), "llama-3.3-70b-versatile", 0.7)
        .await
        .unwrap();
    assert_eq!(text, "fine");
}

#[tokio::test]
async fn compatible_maps_429_to_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::OpenAi, "sk-test", Some(&server.uri()));
    let err = provider
        .chat_with_history(&history(), "gpt-4o-mini", 0.7)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::RateLimited { .. }), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn compatible_maps_401_to_authentication_and_scrubs_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401).set_body_string("Incorrect API key provided: sk-live-abcdef123456"),
        )
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::OpenAi, "sk-live-abcdef123456", Some(&server.uri()));
    let err = provider
        .chat_with_history(&history(), "gpt-4o-mini", 0.7)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Authentication { .. }));
    assert!(!err.to_string().contains("abcdef123456"));
}

#[tokio::test]
async fn compatible_empty_content_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("")))
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::Mistral, "key", Some(&server.uri()));
    let err = provider
        .chat_with_history(&history(), "mistral-small-latest", 0.7)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::EmptyResponse { .. }));
}

#[tokio::test]
async fn compatible_non_json_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::DeepSeek, "key", Some(&server.uri()));
    let err = provider
        .chat_with_history(&history(), "deepseek-chat", 0.7)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::MalformedResponse { .. }));
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic adapter
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn anthropic_lifts_system_prompt_and_sets_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "ant-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "system": "Be brief.",
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" },
                { "role": "user", "content": "how are you?" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "Doing " },
                { "type": "text", "text": "well." }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::Anthropic, "ant-key", Some(&server.uri()));
    let text = provider
        .chat_with_history(&history(), "claude-3-5-haiku-latest", 0.7)
        .await
        .unwrap();
    assert_eq!(text, "Doing well.");
}

#[tokio::test]
async fn anthropic_overloaded_is_retryable_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::Anthropic, "ant-key", Some(&server.uri()));
    let err = provider
        .chat_with_history(&history(), "claude-3-5-haiku-latest", 0.7)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 529, .. }), "{err:?}");
    assert!(err.is_retryable());
}

// ─────────────────────────────────────────────────────────────────────────────
// Gemini adapter
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn gemini_passes_key_as_query_and_maps_roles() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:generateContent"))
        .and(query_param("key", "AIza-test"))
        .and(body_partial_json(json!({
            "systemInstruction": { "parts": [{ "text": "Be brief." }] },
            "contents": [
                { "role": "user", "parts": [{ "text": "hi" }] },
                { "role": "model", "parts": [{ "text": "hello" }] },
                { "role": "user", "parts": [{ "text": "how are you?" }] }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": "Great!" }] } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::Gemini, "AIza-test", Some(&server.uri()));
    let text = provider
        .chat_with_history(&history(), "gemini-2.0-flash", 0.7)
        .await
        .unwrap();
    assert_eq!(text, "Great!");
}

#[tokio::test]
async fn gemini_error_field_in_success_body_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "message": "quota exhausted" }
        })))
        .mount(&server)
        .await;

    let provider = create_provider(ProviderKind::Gemini, "AIza-test", Some(&server.uri()));
    let err = provider
        .chat_with_history(&history(), "gemini-2.0-flash", 0.7)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("quota exhausted"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config → descriptors → engine
// ─────────────────────────────────────────────────────────────────────────────

fn entry(server: &MockServer, key: &str, model: &str) -> ProviderEntryConfig {
    ProviderEntryConfig {
        api_key: Some(key.into()),
        model: Some(model.into()),
        base_url: Some(server.uri()),
    }
}

#[tokio::test]
async fn engine_from_config_falls_back_over_http() {
    let groq = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .expect(1)
        .mount(&groq)
        .await;

    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "gpt-test" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("from openai")))
        .expect(1)
        .mount(&openai)
        .await;

    let mut config = Config::default();
    config.reliability.providers = vec!["groq".into(), "openai".into()];
    config
        .providers
        .insert("groq".into(), entry(&groq, "gsk-1", "llama-test"));
    config
        .providers
        .insert("openai".into(), entry(&openai, "sk-1", "gpt-test"));

    let descriptors = build_descriptors(&config).unwrap();
    assert_eq!(descriptors.len(), 2);

    let engine = FallbackEngine::new(
        descriptors,
        FallbackOptions {
            timeout: Duration::from_secs(5),
            ..FallbackOptions::from_config(&config)
        },
    );
    let result = engine.complete(&[ChatMessage::user("hi")]).await;

    assert!(result.succeeded);
    assert_eq!(result.provider_name, "openai");
    assert_eq!(result.text, "from openai");
}

#[tokio::test]
async fn engine_broadcast_over_http_reports_each_provider() {
    let ok = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply("pong")))
        .mount(&ok)
        .await;

    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&broken)
        .await;

    let mut config = Config::default();
    config.reliability.providers = vec!["anthropic".into(), "groq".into()];
    config
        .providers
        .insert("anthropic".into(), entry(&broken, "ant", "claude-test"));
    config.providers.insert("groq".into(), entry(&ok, "gsk", "llama"));

    let engine = FallbackEngine::new(
        build_descriptors(&config).unwrap(),
        FallbackOptions::from_config(&config),
    );
    let results = engine.broadcast(&[ChatMessage::user("ping")]).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "anthropic");
    assert!(!results[0].1.succeeded);
    assert_eq!(results[0].1.text, "⚠️ anthropic failed: auth");
    assert_eq!(results[1].0, "groq");
    assert_eq!(results[1].1.text, "pong");
}

//! End-to-end pipeline: inbound message → conversation window → provider
//! fallback over HTTP → chunked, paced delivery to a recording channel.

use async_trait::async_trait;
use duobot::channels::{
    BotSession, Channel, ChannelMessage, ConversationStore, DeliveryError, DeliveryOptions,
    DeliveryQueue, SessionSettings, DISCORD_MAX_MESSAGE_CHARS,
};
use duobot::config::{Config, ProviderEntryConfig, ReplyMode};
use duobot::providers::{build_descriptors, ChatMessage, FallbackEngine, FallbackOptions};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingChannel {
    fn sent_to(&self, conversation: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, c)| c == conversation)
            .map(|(text, _)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: &str, conversation_id: &str) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .push((message.to_string(), conversation_id.to_string()));
        Ok(())
    }

    async fn listen(&self, _tx: mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn openai_reply(text: &str) -> serde_json::Value {
    json!({ "choices": [{ "message": { "role": "assistant", "content": text } }] })
}

async fn failing_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_string("unavailable"))
        .mount(&server)
        .await;
    server
}

async fn answering_server(text: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_reply(text)))
        .mount(&server)
        .await;
    server
}

fn config_for(servers: &[(&str, &MockServer)]) -> Config {
    let mut config = Config::default();
    config.discord.bot_token = "token".into();
    config.reliability.providers = servers.iter().map(|(name, _)| (*name).to_string()).collect();
    for (name, server) in servers {
        config.providers.insert(
            (*name).to_string(),
            ProviderEntryConfig {
                api_key: Some(format!("{name}-key")),
                model: Some(format!("{name}-model")),
                base_url: Some(server.uri()),
            },
        );
    }
    config
}

struct Harness {
    channel: Arc<RecordingChannel>,
    session: Arc<BotSession>,
}

fn harness(config: &Config, reply_mode: ReplyMode) -> Harness {
    let channel = Arc::new(RecordingChannel::default());
    let engine = Arc::new(FallbackEngine::new(
        build_descriptors(config).unwrap(),
        FallbackOptions {
            timeout: Duration::from_secs(5),
            ..FallbackOptions::from_config(config)
        },
    ));
    let (delivery, _worker) = DeliveryQueue::spawn(
        channel.clone(),
        DeliveryOptions {
            chunk_limit: config.delivery.chunk_limit,
            chunk_delay: Duration::from_millis(5),
        },
        CancellationToken::new(),
    );
    let session = Arc::new(BotSession::new(
        channel.clone(),
        engine,
        Arc::new(ConversationStore::new(
            config.conversation.history_window,
            config.conversation.max_conversations,
        )),
        delivery,
        SessionSettings {
            reply_mode,
            ..SessionSettings::default()
        },
    ));
    Harness { channel, session }
}

fn mention(conversation: &str, content: &str) -> ChannelMessage {
    ChannelMessage {
        id: format!("{conversation}-{content}"),
        conversation_id: conversation.into(),
        author_id: "7".into(),
        content: content.into(),
        is_direct_message: false,
        mentions_bot: true,
        timestamp: 0,
    }
}

#[tokio::test]
async fn long_answer_from_second_provider_is_paginated() {
    let groq = failing_server(503).await;
    let long_answer = "All work and no play makes a long answer. ".repeat(120);
    let openai = answering_server(&long_answer).await;
    let config = config_for(&[("groq", &groq), ("openai", &openai)]);
    let h = harness(&config, ReplyMode::Fallback);

    h.session.handle_message(mention("c1", "tell me a story")).await;

    let sent = h.channel.sent_to("c1");
    assert!(sent.len() >= 3, "expected pagination, got {} messages", sent.len());
    assert!(sent[0].starts_with("> **tell me a story** - <@7>\n"));
    for (i, text) in sent.iter().enumerate() {
        assert!(text.chars().count() <= DISCORD_MAX_MESSAGE_CHARS);
        let has_marker = text.contains(&format!("page {}…)*", i + 2));
        assert_eq!(has_marker, i + 1 < sent.len(), "marker mismatch on chunk {i}");
    }

    let history = h.session.store().snapshot("c1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1], ChatMessage::assistant(long_answer));
}

#[tokio::test]
async fn exhausted_chain_sends_fallback_and_keeps_user_turns() {
    let groq = failing_server(429).await;
    let openai = failing_server(500).await;
    let config = config_for(&[("groq", &groq), ("openai", &openai)]);
    let h = harness(&config, ReplyMode::Fallback);

    h.session.handle_message(mention("c1", "first")).await;
    h.session.handle_message(mention("c1", "second")).await;

    let sent = h.channel.sent_to("c1");
    assert_eq!(sent.len(), 2);
    for text in &sent {
        assert!(text.ends_with(&config.reliability.fallback_message));
    }
    assert_eq!(
        h.session.store().snapshot("c1"),
        vec![ChatMessage::user("first"), ChatMessage::user("second")]
    );
}

#[tokio::test]
async fn broadcast_labels_each_provider_in_priority_order() {
    let groq = answering_server("groq says hi").await;
    let openai = failing_server(401).await;
    let config = config_for(&[("groq", &groq), ("openai", &openai)]);
    let h = harness(&config, ReplyMode::Broadcast);

    h.session.handle_message(mention("c1", "hello both")).await;

    assert_eq!(
        h.channel.sent_to("c1"),
        vec![
            "> **hello both** - <@7>".to_string(),
            "**🤖 MODEL: groq**\ngroq says hi".to_string(),
            "**🤖 MODEL: openai**\n⚠️ openai failed: auth".to_string(),
        ]
    );
}

#[tokio::test]
async fn dispatch_loop_answers_every_conversation() {
    let groq = answering_server("ok").await;
    let config = config_for(&[("groq", &groq)]);
    let h = harness(&config, ReplyMode::Fallback);

    let (tx, rx) = mpsc::channel(16);
    let dispatch = tokio::spawn(Arc::clone(&h.session).run_dispatch_loop(rx));
    for conversation in ["a", "b", "c"] {
        tx.send(mention(conversation, "ping")).await.unwrap();
        tx.send(mention(conversation, "ping again")).await.unwrap();
    }
    drop(tx);
    dispatch.await.unwrap();

    for conversation in ["a", "b", "c"] {
        let sent = h.channel.sent_to(conversation);
        assert_eq!(sent.len(), 2, "conversation {conversation}");
        assert!(sent[0].starts_with("> **ping** - <@7>"));
        assert!(sent[1].starts_with("> **ping again** - <@7>"));
        assert_eq!(h.session.store().snapshot(conversation).len(), 4);
    }
}

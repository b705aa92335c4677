//! Bot session: inbound dispatch, per-conversation serialization, and the
//! reply pipeline that ties the conversation store, the fallback engine and
//! the delivery queue together.
//!
//! Messages of one conversation are handled strictly one after another, in
//! arrival order, including full delivery of the reply. Different
//! conversations proceed concurrently up to `max_in_flight`.

pub mod chunk;
pub mod delivery;
pub mod discord;
pub mod history;
pub mod traits;

pub use chunk::{chunk, DEFAULT_CHUNK_LIMIT, DISCORD_MAX_MESSAGE_CHARS};
pub use delivery::{DeliveryOptions, DeliveryQueue, DeliveryReport, OutboundChunk, OutboundReply};
pub use discord::DiscordChannel;
pub use history::{ConversationContext, ConversationStore};
pub use traits::{Channel, ChannelMessage, DeliveryError};

use crate::config::{BotConfig, Config, ReplyMode};
use crate::providers::{self, ChatMessage, FallbackEngine, FallbackOptions};
use crate::util::truncate_with_ellipsis;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong while handling your message.";
pub const RESET_CONFIRMATION: &str = "Conversation history cleared. Starting fresh.";

const TYPING_REFRESH_INTERVAL_SECS: u64 = 8;
const MAX_HEADER_QUESTION_CHARS: usize = 300;
const INBOUND_QUEUE_CAPACITY: usize = 100;

/// Reply policy for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub reply_mode: ReplyMode,
    pub reply_all: bool,
    pub reply_channel_id: Option<String>,
    pub max_in_flight: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            reply_mode: config.reply_mode,
            reply_all: config.reply_all,
            reply_channel_id: config.reply_channel_id.clone(),
            max_in_flight: config.max_in_flight.max(1),
        }
    }
}

/// Header quoting the question and mentioning its author.
fn reply_header(msg: &ChannelMessage) -> String {
    let question = msg.content.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "> **{}** - <@{}>",
        truncate_with_ellipsis(&question, MAX_HEADER_QUESTION_CHARS),
        msg.author_id
    )
}

/// Body of one provider's reply in broadcast mode.
pub fn broadcast_body(provider: &str, text: &str) -> String {
    format!("**🤖 MODEL: {provider}**\n{text}")
}

fn is_reset_command(content: &str) -> bool {
    matches!(content.trim(), "/reset" | "!reset")
}

pub struct BotSession {
    channel: Arc<dyn Channel>,
    engine: Arc<FallbackEngine>,
    store: Arc<ConversationStore>,
    delivery: DeliveryQueue,
    settings: SessionSettings,
}

impl BotSession {
    pub fn new(
        channel: Arc<dyn Channel>,
        engine: Arc<FallbackEngine>,
        store: Arc<ConversationStore>,
        delivery: DeliveryQueue,
        settings: SessionSettings,
    ) -> Self {
        Self {
            channel,
            engine,
            store,
            delivery,
            settings,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// A message is answered when it mentions the bot, arrives as a DM, or
    /// lands in the reply-all channel while that mode is on.
    pub fn should_handle(&self, msg: &ChannelMessage) -> bool {
        if msg.content.trim().is_empty() {
            return false;
        }
        let in_reply_all_channel = self.settings.reply_all
            && self.settings.reply_channel_id.as_deref() == Some(msg.conversation_id.as_str());
        msg.mentions_bot || msg.is_direct_message || in_reply_all_channel
    }

    /// Top-level handler. Never fails: any pipeline error is logged and
    /// answered with a generic failure message.
    pub async fn handle_message(&self, msg: ChannelMessage) {
        if is_reset_command(&msg.content) {
            self.store.clear(&msg.conversation_id);
            tracing::info!(conversation = %msg.conversation_id, "Conversation history cleared");
            if let Err(e) = self
                .deliver(OutboundReply::new(&msg.conversation_id, RESET_CONFIRMATION))
                .await
            {
                tracing::error!(conversation = %msg.conversation_id, error = %e, "Failed to confirm reset");
            }
            return;
        }

        let typing_stop = CancellationToken::new();
        let typing = spawn_scoped_typing_task(
            Arc::clone(&self.channel),
            msg.conversation_id.clone(),
            typing_stop.clone(),
        );

        let outcome = self.run_pipeline(&msg).await;

        typing_stop.cancel();
        let _ = typing.await;

        if let Err(e) = outcome {
            tracing::error!(
                conversation = %msg.conversation_id,
                error = %e,
                "Message pipeline failed"
            );
            self.report_failure(&msg.conversation_id).await;
        }
    }

    /// Tell the user something went wrong. Falls back to a direct send when
    /// the delivery queue itself is what failed.
    async fn report_failure(&self, conversation_id: &str) {
        let apology = OutboundReply::new(conversation_id, GENERIC_FAILURE_MESSAGE);
        let Err(e) = self.deliver(apology).await else {
            return;
        };
        tracing::warn!(
            conversation = %conversation_id,
            error = %e,
            "Delivery queue unavailable; sending failure notice directly"
        );
        if let Err(e) = self.channel.send(GENERIC_FAILURE_MESSAGE, conversation_id).await {
            tracing::error!(conversation = %conversation_id, error = %e, "Failed to report failure");
        }
    }

    async fn run_pipeline(&self, msg: &ChannelMessage) -> Result<()> {
        let question = msg.content.trim();
        if question.is_empty() {
            return Ok(());
        }

        tracing::info!(
            conversation = %msg.conversation_id,
            author = %msg.author_id,
            preview = %truncate_with_ellipsis(question, 80),
            "Handling message"
        );

        let request = self
            .store
            .snapshot_with(&msg.conversation_id, ChatMessage::user(question));

        match self.settings.reply_mode {
            ReplyMode::Fallback => self.reply_with_fallback(msg, &request).await,
            ReplyMode::Broadcast => self.reply_with_broadcast(msg, &request).await,
        }
    }

    async fn reply_with_fallback(&self, msg: &ChannelMessage, request: &[ChatMessage]) -> Result<()> {
        let result = self.engine.complete(request).await;
        if result.succeeded {
            self.store
                .append(&msg.conversation_id, ChatMessage::assistant(result.text.clone()));
        }

        let reply = OutboundReply::new(&msg.conversation_id, result.text).with_header(reply_header(msg));
        self.deliver(reply).await
    }

    async fn reply_with_broadcast(&self, msg: &ChannelMessage, request: &[ChatMessage]) -> Result<()> {
        let results = self.engine.broadcast(request).await;
        let header = reply_header(msg);

        if results.is_empty() {
            let fallback = self.engine.options().fallback_message.clone();
            return self
                .deliver(OutboundReply::new(&msg.conversation_id, fallback).with_header(header))
                .await;
        }

        if let Some((_, first)) = results.iter().find(|(_, r)| r.succeeded) {
            self.store
                .append(&msg.conversation_id, ChatMessage::assistant(first.text.clone()));
        }

        self.deliver(OutboundReply::new(&msg.conversation_id, "").with_header(header))
            .await?;
        for (name, result) in results {
            let reply = OutboundReply::new(&msg.conversation_id, broadcast_body(&name, &result.text))
                .with_label(name);
            self.deliver(reply).await?;
        }
        Ok(())
    }

    async fn deliver(&self, reply: OutboundReply) -> Result<()> {
        let conversation = reply.conversation_id.clone();
        let report = self.delivery.deliver(reply).await?;
        if !report.is_complete() {
            tracing::warn!(
                conversation = %conversation,
                sent = report.sent,
                failed = report.failed,
                "Reply partially delivered"
            );
        }
        Ok(())
    }

    /// Consume inbound events until the sender side closes.
    pub async fn run_dispatch_loop(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::Receiver<ChannelMessage>,
    ) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.settings.max_in_flight));
        let mut workers = tokio::task::JoinSet::new();
        // Latest in-flight task per conversation; the next message waits on it.
        let mut tails: HashMap<String, Arc<InFlightTaskCompletion>> = HashMap::new();

        while let Some(msg) = rx.recv().await {
            if !self.should_handle(&msg) {
                continue;
            }

            tails.retain(|_, completion| !completion.is_done());
            let completion = Arc::new(InFlightTaskCompletion::new());
            let previous = tails.insert(msg.conversation_id.clone(), Arc::clone(&completion));

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let session = Arc::clone(&self);
            workers.spawn(async move {
                let _permit = permit;
                let _done = CompletionGuard(completion);
                if let Some(previous) = previous {
                    previous.wait().await;
                }
                session.handle_message(msg).await;
            });

            while let Some(result) = workers.try_join_next() {
                log_worker_join_result(result);
            }
        }

        while let Some(result) = workers.join_next().await {
            log_worker_join_result(result);
        }
    }
}

struct InFlightTaskCompletion {
    done: AtomicBool,
    notify: tokio::sync::Notify,
}

impl InFlightTaskCompletion {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_done() {
            return;
        }
        notified.await;
    }
}

/// Marks the task done on drop, including when the handler panics.
struct CompletionGuard(Arc<InFlightTaskCompletion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

fn log_worker_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        tracing::error!("Channel message worker crashed: {error}");
    }
}

fn spawn_scoped_typing_task(
    channel: Arc<dyn Channel>,
    conversation_id: String,
    stop_signal: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(TYPING_REFRESH_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = stop_signal.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = channel.start_typing(&conversation_id).await {
                        tracing::debug!("Failed to start typing on {}: {e}", channel.name());
                    }
                }
            }
        }

        if let Err(e) = channel.stop_typing(&conversation_id).await {
            tracing::debug!("Failed to stop typing on {}: {e}", channel.name());
        }
    })
}

/// Keep `listen` running, restarting it with exponential backoff.
pub fn spawn_supervised_listener(
    ch: Arc<dyn Channel>,
    tx: tokio::sync::mpsc::Sender<ChannelMessage>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            let result = ch.listen(tx.clone()).await;

            if tx.is_closed() {
                break;
            }

            match result {
                Ok(()) => {
                    tracing::warn!("Channel {} exited unexpectedly; restarting", ch.name());
                    // Clean exit: reset backoff since the listener ran successfully
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!("Channel {} error: {e}; restarting", ch.name());
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double backoff AFTER sleeping so first error uses initial_backoff
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

/// Build the engine from configuration. Providers without credentials are
/// omitted; an empty set is allowed and yields the fallback message.
pub fn build_engine(config: &Config) -> Result<FallbackEngine> {
    let descriptors = providers::build_descriptors(config)?;
    if descriptors.is_empty() {
        tracing::warn!("No provider has a usable credential; every reply will be the fallback message");
    } else {
        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        tracing::info!(providers = ?names, "Provider fallback order");
    }
    Ok(FallbackEngine::new(descriptors, FallbackOptions::from_config(config)))
}

/// Run the Discord bot and the health endpoint until Ctrl-C.
pub async fn start_bot(config: Config) -> Result<()> {
    config.validate()?;

    let engine = Arc::new(build_engine(&config)?);
    engine.warmup().await;

    let channel: Arc<dyn Channel> = Arc::new(DiscordChannel::from_config(&config.discord));
    if !channel.health_check().await {
        tracing::warn!("Discord API health check failed; the listener will keep retrying");
    }
    let shutdown = CancellationToken::new();
    let (delivery, delivery_worker) = DeliveryQueue::spawn(
        Arc::clone(&channel),
        DeliveryOptions::from_config(&config.delivery),
        shutdown.clone(),
    );

    let store = Arc::new(
        ConversationStore::new(
            config.conversation.history_window,
            config.conversation.max_conversations,
        )
        .with_system_prompt(config.system_prompt.clone()),
    );

    let session = Arc::new(BotSession::new(
        Arc::clone(&channel),
        engine,
        store,
        delivery,
        SessionSettings::from_config(&config.bot),
    ));

    let gateway = if config.gateway.enabled {
        let gateway_config = config.gateway.clone();
        let gateway_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = crate::gateway::run_gateway(&gateway_config, gateway_shutdown).await {
                tracing::error!("Health endpoint stopped: {e}");
            }
        }))
    } else {
        None
    };

    let (tx, rx) = tokio::sync::mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let listener = spawn_supervised_listener(
        Arc::clone(&channel),
        tx,
        config.reliability.channel_initial_backoff_secs,
        config.reliability.channel_max_backoff_secs,
    );
    let dispatch = tokio::spawn(session.run_dispatch_loop(rx));

    tracing::info!("duobot is running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    // Stopping the listener closes the inbound queue; in-flight replies finish.
    listener.abort();
    let _ = listener.await;
    let _ = dispatch.await;

    shutdown.cancel();
    let _ = delivery_worker.await;
    if let Some(gateway) = gateway {
        let _ = gateway.await;
    }
    Ok(())
}

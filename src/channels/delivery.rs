//! Single-consumer outbound queue.
//!
//! Every reply in the process funnels through one task that chunks, paginates
//! and sends it. Consecutive sends are spaced by at least `chunk_delay`, both
//! within a reply and across replies. A failed chunk is logged and counted;
//! the remaining chunks of the same reply are still attempted.

use super::chunk::{chunk, DEFAULT_CHUNK_LIMIT};
use super::traits::{Channel, DeliveryError};
use crate::util::truncate_with_ellipsis;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MAX_LABEL_CHARS: usize = 40;
const MAX_PAGE_DIGITS: usize = 6;

/// Upper bound on the characters `continuation_marker` appends to a chunk:
/// the fixed text, a truncated label with its ellipsis and the page number.
/// Chunk limits must leave this much room below the platform cap.
pub const MAX_CONTINUATION_MARKER_CHARS: usize = "\n*(continued ".len()
    + MAX_LABEL_CHARS
    + "...".len()
    + ", page ".len()
    + MAX_PAGE_DIGITS
    // "…)*"
    + 3;

/// A rendered reply waiting to be chunked and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub conversation_id: String,
    /// Prepended to the body before chunking, so it lands in the first chunk.
    pub header: Option<String>,
    pub body: String,
    /// Shown in pagination markers, e.g. the provider name in broadcast mode.
    pub label: Option<String>,
}

impl OutboundReply {
    pub fn new(conversation_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            header: None,
            body: body.into(),
            label: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn rendered_text(&self) -> String {
        match (&self.header, self.body.is_empty()) {
            (Some(header), true) => header.clone(),
            (Some(header), false) => format!("{header}\n{}", self.body),
            (None, _) => self.body.clone(),
        }
    }
}

/// One platform message of a paginated reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChunk {
    pub text: String,
    pub is_final: bool,
    /// Zero-based.
    pub page_index: usize,
}

/// Outcome of delivering one reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

fn continuation_marker(label: Option<&str>, next_page: usize) -> String {
    match label {
        Some(label) => format!(
            "\n*(continued {}, page {next_page}…)*",
            truncate_with_ellipsis(label, MAX_LABEL_CHARS)
        ),
        None => format!("\n*(continued, page {next_page}…)*"),
    }
}

/// Chunk a reply and attach a continuation marker to every non-final chunk.
pub fn paginate(reply: &OutboundReply, limit: usize) -> Vec<OutboundChunk> {
    let pieces = chunk(&reply.rendered_text(), limit);
    let last = pieces.len() - 1;

    pieces
        .into_iter()
        .enumerate()
        .map(|(page_index, piece)| {
            let is_final = page_index == last;
            let text = if is_final {
                piece
            } else {
                piece + &continuation_marker(reply.label.as_deref(), page_index + 2)
            };
            OutboundChunk {
                text,
                is_final,
                page_index,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub chunk_limit: usize,
    pub chunk_delay: Duration,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            chunk_limit: DEFAULT_CHUNK_LIMIT,
            chunk_delay: Duration::from_millis(1000),
        }
    }
}

impl DeliveryOptions {
    pub fn from_config(config: &crate::config::DeliveryConfig) -> Self {
        Self {
            chunk_limit: config.chunk_limit,
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
        }
    }
}

struct DeliveryJob {
    reply: OutboundReply,
    done: Option<oneshot::Sender<DeliveryReport>>,
}

/// Cloneable handle to the process-wide delivery consumer.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<DeliveryJob>,
}

impl DeliveryQueue {
    /// Start the consumer task. It exits when every handle is dropped or
    /// `shutdown` is cancelled, after draining replies already queued.
    pub fn spawn(
        channel: Arc<dyn Channel>,
        options: DeliveryOptions,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_consumer(channel, options, rx, shutdown));
        (Self { tx }, worker)
    }

    /// Queue a reply without waiting for it to be sent.
    pub fn enqueue(&self, reply: OutboundReply) {
        let conversation = reply.conversation_id.clone();
        if self.tx.send(DeliveryJob { reply, done: None }).is_err() {
            tracing::warn!(conversation = %conversation, "Delivery queue closed; reply dropped");
        }
    }

    /// Queue a reply and wait until every chunk of it was attempted.
    pub async fn deliver(&self, reply: OutboundReply) -> Result<DeliveryReport, DeliveryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(DeliveryJob {
                reply,
                done: Some(done_tx),
            })
            .map_err(|_| DeliveryError::Transport("delivery queue closed".into()))?;
        done_rx
            .await
            .map_err(|_| DeliveryError::Transport("delivery worker stopped".into()))
    }
}

struct Pacer {
    delay: Duration,
    last_send: Option<Instant>,
}

impl Pacer {
    async fn wait_turn(&mut self) {
        if let Some(last) = self.last_send {
            tokio::time::sleep_until(last + self.delay).await;
        }
        self.last_send = Some(Instant::now());
    }
}

async fn run_consumer(
    channel: Arc<dyn Channel>,
    options: DeliveryOptions,
    mut rx: mpsc::UnboundedReceiver<DeliveryJob>,
    shutdown: CancellationToken,
) {
    let mut pacer = Pacer {
        delay: options.chunk_delay,
        last_send: None,
    };
    let mut draining = false;

    loop {
        let job = if draining {
            rx.recv().await
        } else {
            tokio::select! {
                () = shutdown.cancelled() => {
                    rx.close();
                    draining = true;
                    continue;
                }
                job = rx.recv() => job,
            }
        };

        let Some(job) = job else {
            break;
        };

        let report = send_reply(channel.as_ref(), &job.reply, options.chunk_limit, &mut pacer).await;
        if let Some(done) = job.done {
            let _ = done.send(report);
        }
    }

    tracing::debug!(channel = channel.name(), "Delivery queue stopped");
}

async fn send_reply(
    channel: &dyn Channel,
    reply: &OutboundReply,
    chunk_limit: usize,
    pacer: &mut Pacer,
) -> DeliveryReport {
    let chunks = paginate(reply, chunk_limit);
    let total = chunks.len();
    let mut report = DeliveryReport::default();

    for chunk in chunks {
        pacer.wait_turn().await;
        match channel.send(&chunk.text, &reply.conversation_id).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    channel = channel.name(),
                    conversation = %reply.conversation_id,
                    page = chunk.page_index + 1,
                    pages = total,
                    error = %e,
                    "Failed to deliver chunk; continuing with the rest"
                );
            }
        }
    }

    report
}

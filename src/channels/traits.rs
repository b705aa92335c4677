use async_trait::async_trait;

/// An inbound message event delivered by a platform listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: String,
    /// Channel or DM id the reply must go back to.
    pub conversation_id: String,
    pub author_id: String,
    /// User text with the bot mention already stripped.
    pub content: String,
    pub is_direct_message: bool,
    pub mentions_bot: bool,
    pub timestamp: u64,
}

/// Failure to hand one message to the platform.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("platform rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Core channel trait, implemented per messaging platform
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Send one platform-legal message to a conversation
    async fn send(&self, message: &str, conversation_id: &str) -> Result<(), DeliveryError>;

    /// Start listening for incoming messages (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }

    /// Show a "typing" indicator once. Callers refresh it while a reply is
    /// being generated.
    async fn start_typing(&self, _conversation_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop any active typing indicator.
    async fn stop_typing(&self, _conversation_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

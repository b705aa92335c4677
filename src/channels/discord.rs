use super::traits::{Channel, ChannelMessage, DeliveryError};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 = 37377;

/// Discord channel: connects via the Gateway WebSocket for real-time messages
pub struct DiscordChannel {
    bot_token: String,
    guild_id: Option<String>,
    allowed_users: Vec<String>,
    api_base: String,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(bot_token: String, guild_id: Option<String>, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            guild_id,
            allowed_users,
            api_base: DISCORD_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &crate::config::DiscordConfig) -> Self {
        Self::new(
            config.bot_token.clone(),
            config.guild_id.clone().filter(|g| !g.trim().is_empty()),
            config.allowed_users.clone(),
        )
    }

    /// Point REST calls at a different base URL.
    #[must_use]
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Check if a Discord user ID is in the allowlist.
    /// Empty list or `"*"` means allow everyone.
    fn is_user_allowed(&self, user_id: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == "*" || u == user_id)
    }

    fn bot_user_id_from_token(token: &str) -> Option<String> {
        // Discord bot tokens are base64(bot_user_id).timestamp.hmac
        let part = token.split('.').next()?.trim_end_matches('=');
        let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(part)
            .ok()?;
        String::from_utf8(bytes).ok().filter(|id| !id.is_empty())
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    /// Turn a `MESSAGE_CREATE` payload into an inbound event, applying the
    /// bot, allowlist and guild filters.
    fn parse_message_create(
        &self,
        d: &serde_json::Value,
        bot_user_id: &str,
    ) -> Option<ChannelMessage> {
        let author = d.get("author")?;
        let author_id = author.get("id").and_then(serde_json::Value::as_str)?;

        // Skip messages from the bot itself and from other bots
        if author_id == bot_user_id
            || author
                .get("bot")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false)
        {
            return None;
        }

        if !self.is_user_allowed(author_id) {
            tracing::warn!("Discord: ignoring message from unauthorized user: {author_id}");
            return None;
        }

        // DMs have no guild_id and always pass the guild filter
        let msg_guild = d.get("guild_id").and_then(serde_json::Value::as_str);
        if let (Some(filter), Some(guild)) = (self.guild_id.as_deref(), msg_guild) {
            if guild != filter {
                return None;
            }
        }

        let raw = d.get("content").and_then(serde_json::Value::as_str)?;
        let (content, mentioned_inline) = strip_bot_mention(raw, bot_user_id);
        let mentioned_by_list = !bot_user_id.is_empty()
            && d.get("mentions")
                .and_then(serde_json::Value::as_array)
                .is_some_and(|mentions| {
                    mentions.iter().any(|m| {
                        m.get("id").and_then(serde_json::Value::as_str) == Some(bot_user_id)
                    })
                });

        let conversation_id = d.get("channel_id").and_then(serde_json::Value::as_str)?;

        Some(ChannelMessage {
            id: d
                .get("id")
                .and_then(serde_json::Value::as_str)
                .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string),
            conversation_id: conversation_id.to_string(),
            author_id: author_id.to_string(),
            content,
            is_direct_message: msg_guild.is_none(),
            mentions_bot: mentioned_inline || mentioned_by_list,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        })
    }
}

/// Remove `<@id>` and `<@!id>` mentions of the bot. Returns the trimmed text
/// and whether a mention was present.
fn strip_bot_mention(content: &str, bot_user_id: &str) -> (String, bool) {
    if bot_user_id.is_empty() {
        return (content.trim().to_string(), false);
    }

    let plain = format!("<@{bot_user_id}>");
    let nick = format!("<@!{bot_user_id}>");
    let mentioned = content.contains(&plain) || content.contains(&nick);
    let stripped = content.replace(&plain, "").replace(&nick, "");
    (stripped.trim().to_string(), mentioned)
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, message: &str, conversation_id: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/channels/{conversation_id}/messages", self.api_base);
        // Replies quote user text; only user mentions may ping.
        let body = json!({
            "content": message,
            "allowed_mentions": { "parse": ["users"] }
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.without_url().to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let err = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
            return Err(DeliveryError::Rejected {
                status,
                message: crate::providers::sanitize_api_error(&err),
            });
        }

        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let bot_user_id = Self::bot_user_id_from_token(&self.bot_token).unwrap_or_default();

        // Get Gateway URL
        let gw_resp: serde_json::Value = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let gw_url = gw_resp
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or("wss://gateway.discord.gg");

        let ws_url = format!("{gw_url}/?v=10&encoding=json");
        tracing::info!("Discord: connecting to gateway...");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Read Hello (opcode 10)
        let hello = read.next().await.ok_or(anyhow::anyhow!("No hello"))??;
        let hello_data: serde_json::Value = serde_json::from_str(hello.to_text()?)?;
        let heartbeat_interval = hello_data
            .get("d")
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(41250);

        // Send Identify (opcode 2)
        let identify = json!({
            "op": 2,
            "d": {
                "token": self.bot_token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "duobot",
                    "device": "duobot"
                }
            }
        });
        write.send(Message::Text(identify.to_string().into())).await?;

        tracing::info!("Discord: connected and identified");

        // Only accessed in the select! loop below.
        let mut sequence: i64 = -1;

        // Heartbeat timer sends a tick; the heartbeat itself is assembled in
        // the select! loop where `sequence` lives.
        let (hb_tx, mut hb_rx) = tokio::sync::mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval));
            loop {
                interval.tick().await;
                if hb_tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = hb_rx.recv() => {
                    let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                    let hb = json!({"op": 1, "d": d});
                    if write.send(Message::Text(hb.to_string().into())).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => return Err(e.into()),
                        _ => continue,
                    };

                    let Ok(event) = serde_json::from_str::<serde_json::Value>(msg.as_str()) else {
                        continue;
                    };

                    if let Some(s) = event.get("s").and_then(serde_json::Value::as_i64) {
                        sequence = s;
                    }

                    match event.get("op").and_then(serde_json::Value::as_u64).unwrap_or(0) {
                        // Op 1: Server requests an immediate heartbeat
                        1 => {
                            let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                            let hb = json!({"op": 1, "d": d});
                            if write.send(Message::Text(hb.to_string().into())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        // Op 7: Reconnect
                        7 => {
                            tracing::warn!("Discord: received Reconnect (op 7), closing for restart");
                            break;
                        }
                        // Op 9: Invalid Session
                        9 => {
                            tracing::warn!("Discord: received Invalid Session (op 9), closing for restart");
                            break;
                        }
                        _ => {}
                    }

                    if event.get("t").and_then(|t| t.as_str()) != Some("MESSAGE_CREATE") {
                        continue;
                    }

                    let Some(d) = event.get("d") else {
                        continue;
                    };

                    let Some(channel_msg) = self.parse_message_create(d, &bot_user_id) else {
                        continue;
                    };

                    if tx.send(channel_msg).await.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// One typing pulse; Discord shows it for about 10 seconds.
    async fn start_typing(&self, conversation_id: &str) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/channels/{conversation_id}/typing", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

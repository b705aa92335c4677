use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

/// Platform hard cap on a single message, in characters.
pub const PLATFORM_MAX_MESSAGE_CHARS: usize = 2000;

/// Largest `delivery.chunk_limit` that still leaves room for a pagination marker.
pub const MAX_CHUNK_LIMIT: usize =
    PLATFORM_MAX_MESSAGE_CHARS - crate::channels::delivery::MAX_CONTINUATION_MARKER_CHARS;

const REDACTED: &str = "***";

/// Configuration problems that prevent the bot from starting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Discord bot token is missing. Set DISCORD_BOT_TOKEN or [discord].bot_token")]
    MissingBotToken,

    #[error("unknown provider '{0}' in provider priority list")]
    UnknownProvider(String),

    #[error("provider priority list is empty")]
    NoProviders,

    #[error("conversation.history_window must be greater than 0")]
    InvalidHistoryWindow,

    #[error("delivery.chunk_limit must be between 1 and {max} (got {0})", max = MAX_CHUNK_LIMIT)]
    InvalidChunkLimit(usize),

    #[error("default_temperature must be within 0.0..=2.0 (got {0})")]
    InvalidTemperature(f64),

    #[error("bot.reply_all is enabled but bot.reply_channel_id is not set")]
    ReplyChannelMissing,

    #[error("gateway.host must not be empty")]
    EmptyGatewayHost,
}

/// How a reply is produced for an accepted message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// First successful provider in priority order answers.
    #[default]
    Fallback,
    /// Every provider answers; each reply is labelled with its provider.
    Broadcast,
}

impl FromStr for ReplyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fallback" | "single" => Ok(Self::Fallback),
            "broadcast" | "dual" | "all" => Ok(Self::Broadcast),
            other => Err(format!("unknown reply mode '{other}'")),
        }
    }
}

/// Top-level `config.toml` layout.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Provider promoted to the front of the priority list (e.g. `"groq"`).
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Model for the primary provider. Overridden by `DUOBOT_MODEL` or `MODEL`.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Default model temperature (0.0–2.0). Default: `0.7`.
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    /// Optional system prompt sent ahead of every conversation window. Never stored.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Discord connection settings (`[discord]`).
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Per-provider overrides keyed by provider id (`[providers.groq]`, ...).
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntryConfig>,

    /// Provider order, timeouts, retries and channel restart backoff (`[reliability]`).
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Conversation memory limits (`[conversation]`).
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Outbound chunking and pacing (`[delivery]`).
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Which messages get a reply and how (`[bot]`).
    #[serde(default)]
    pub bot: BotConfig,

    /// Health endpoint (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            default_provider: None,
            default_model: None,
            default_temperature: default_temperature(),
            system_prompt: None,
            discord: DiscordConfig::default(),
            providers: BTreeMap::new(),
            reliability: ReliabilityConfig::default(),
            conversation: ConversationConfig::default(),
            delivery: DeliveryConfig::default(),
            bot: BotConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Discord bot credentials and filters (`[discord]` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DiscordConfig {
    /// Bot token. Overridden by `DISCORD_BOT_TOKEN`. Required.
    #[serde(default)]
    pub bot_token: String,
    /// Only accept guild messages from this guild. DMs always pass.
    #[serde(default)]
    pub guild_id: Option<String>,
    /// Allowed Discord user IDs. Empty or `"*"` allows everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// Per-provider settings (`[providers.<id>]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProviderEntryConfig {
    /// API key; falls back to the provider's environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model id sent to this provider.
    #[serde(default)]
    pub model: Option<String>,
    /// Endpoint override for proxies and self-hosted gateways.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Reliability settings (`[reliability]` section).
///
/// Controls provider order, per-call timeout, retries, and channel restart backoff.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityConfig {
    /// Providers in fallback order. Overridden by `DUOBOT_PROVIDERS`.
    #[serde(default = "default_provider_priority")]
    pub providers: Vec<String>,
    /// Upper bound for one provider call (default: 30)
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Retries per provider for retryable errors before failing over (default: 0)
    #[serde(default)]
    pub provider_retries: u32,
    /// Base backoff (ms) for provider retry delay.
    #[serde(default = "default_provider_backoff_ms")]
    pub provider_backoff_ms: u64,
    /// Reply sent when every provider failed.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
    /// Initial backoff for channel restarts.
    #[serde(default = "default_channel_backoff_secs")]
    pub channel_initial_backoff_secs: u64,
    /// Max backoff for channel restarts.
    #[serde(default = "default_channel_backoff_max_secs")]
    pub channel_max_backoff_secs: u64,
}

fn default_provider_priority() -> Vec<String> {
    ["groq", "openai", "anthropic", "gemini", "openrouter"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_provider_backoff_ms() -> u64 {
    500
}

fn default_fallback_message() -> String {
    crate::providers::fallback::DEFAULT_FALLBACK_MESSAGE.into()
}

fn default_channel_backoff_secs() -> u64 {
    2
}

fn default_channel_backoff_max_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            providers: default_provider_priority(),
            provider_timeout_secs: default_provider_timeout_secs(),
            provider_retries: 0,
            provider_backoff_ms: default_provider_backoff_ms(),
            fallback_message: default_fallback_message(),
            channel_initial_backoff_secs: default_channel_backoff_secs(),
            channel_max_backoff_secs: default_channel_backoff_max_secs(),
        }
    }
}

/// Conversation memory (`[conversation]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConversationConfig {
    /// Turns kept per conversation (default: 8)
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Conversations tracked before the least recently used is evicted (default: 1000)
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
}

fn default_history_window() -> usize {
    8
}

fn default_max_conversations() -> usize {
    1000
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            max_conversations: default_max_conversations(),
        }
    }
}

/// Outbound delivery (`[delivery]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryConfig {
    /// Max characters per chunk before the pagination marker (default: 1900)
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
    /// Minimum delay between consecutive sends (default: 1000)
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

fn default_chunk_limit() -> usize {
    crate::channels::chunk::DEFAULT_CHUNK_LIMIT
}

fn default_chunk_delay_ms() -> u64 {
    1000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunk_limit: default_chunk_limit(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

/// Reply policy (`[bot]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BotConfig {
    /// `fallback` (default) or `broadcast`. Overridden by `DUOBOT_REPLY_MODE`.
    #[serde(default)]
    pub reply_mode: ReplyMode,
    /// Answer every message in `reply_channel_id`, not only mentions.
    #[serde(default)]
    pub reply_all: bool,
    /// Target channel for `reply_all`.
    #[serde(default)]
    pub reply_channel_id: Option<String>,
    /// Max messages handled concurrently across conversations (default: 8)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    8
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            reply_mode: ReplyMode::default(),
            reply_all: false,
            reply_channel_id: None,
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Health endpoint configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Serve the health endpoint alongside the bot (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Gateway host (default: 0.0.0.0)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 8000). Overridden by `PORT`.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "default_gateway_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_gateway_host(),
            port: default_gateway_port(),
            request_timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".duobot"))
}

/// Config directory precedence: explicit flag > `DUOBOT_CONFIG_DIR` > `~/.duobot`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var("DUOBOT_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir.trim()));
        }
    }
    default_config_dir()
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Read `config.toml` from the resolved config directory (defaults when absent),
    /// then apply environment overrides. Does not validate.
    pub async fn load(config_dir: Option<&Path>) -> Result<Self> {
        let dir = resolve_config_dir(config_dir)?;
        let config_path = dir.join("config.toml");

        let mut config = if fs::try_exists(&config_path).await.unwrap_or(false) {
            let contents = fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?
        } else {
            tracing::debug!(path = %config_path.display(), "No config file; using defaults");
            Config::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = env_non_empty("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = token;
        }
        if let Some(guild) = env_non_empty("DISCORD_GUILD_ID") {
            self.discord.guild_id = Some(guild);
        }
        if let Some(users) = env_non_empty("DISCORD_ALLOWED_USERS") {
            self.discord.allowed_users = split_list(&users);
        }

        if let Some(providers) = env_non_empty("DUOBOT_PROVIDERS") {
            self.reliability.providers = split_list(&providers);
        }
        if let Some(provider) = env_non_empty("DUOBOT_PROVIDER") {
            self.default_provider = Some(provider);
        }

        // Model: DUOBOT_MODEL or MODEL
        if let Some(model) = env_non_empty("DUOBOT_MODEL").or_else(|| env_non_empty("MODEL")) {
            self.default_model = Some(model);
        }

        if let Some(raw) = env_non_empty("DUOBOT_TEMPERATURE") {
            match raw.parse::<f64>() {
                Ok(temperature) => self.default_temperature = temperature,
                Err(_) => tracing::warn!("Ignoring invalid DUOBOT_TEMPERATURE={raw}"),
            }
        }

        if let Some(prompt) = env_non_empty("DUOBOT_SYSTEM_PROMPT") {
            self.system_prompt = Some(prompt);
        }

        if let Some(raw) = env_non_empty("DUOBOT_HISTORY_WINDOW") {
            match raw.parse::<usize>() {
                Ok(window) => self.conversation.history_window = window,
                Err(_) => tracing::warn!("Ignoring invalid DUOBOT_HISTORY_WINDOW={raw}"),
            }
        }

        if let Some(raw) = env_non_empty("DUOBOT_REPLY_ALL") {
            match parse_bool(&raw) {
                Some(flag) => self.bot.reply_all = flag,
                None => tracing::warn!(
                    "Ignoring invalid DUOBOT_REPLY_ALL (valid: 1|0|true|false|yes|no|on|off)"
                ),
            }
        }
        if let Some(channel) = env_non_empty("DUOBOT_REPLY_CHANNEL_ID") {
            self.bot.reply_channel_id = Some(channel);
        }
        if let Some(raw) = env_non_empty("DUOBOT_REPLY_MODE") {
            match raw.parse::<ReplyMode>() {
                Ok(mode) => self.bot.reply_mode = mode,
                Err(e) => tracing::warn!("Ignoring DUOBOT_REPLY_MODE: {e}"),
            }
        }

        // Port: PORT (hosting platforms) or DUOBOT_GATEWAY_PORT
        if let Some(raw) = env_non_empty("PORT").or_else(|| env_non_empty("DUOBOT_GATEWAY_PORT")) {
            match raw.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid gateway port {raw}"),
            }
        }
        if let Some(host) = env_non_empty("DUOBOT_GATEWAY_HOST") {
            self.gateway.host = host;
        }
    }

    /// Copy with the bot token and provider keys masked, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.discord.bot_token.is_empty() {
            config.discord.bot_token = REDACTED.into();
        }
        for entry in config.providers.values_mut() {
            if entry.api_key.is_some() {
                entry.api_key = Some(REDACTED.into());
            }
        }
        config
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.discord.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingBotToken);
        }

        if self.reliability.providers.is_empty() && self.default_provider.is_none() {
            return Err(ConfigError::NoProviders);
        }
        crate::providers::priority_order(self)?;

        if self.conversation.history_window == 0 {
            return Err(ConfigError::InvalidHistoryWindow);
        }

        let chunk_limit = self.delivery.chunk_limit;
        if chunk_limit == 0 || chunk_limit > MAX_CHUNK_LIMIT {
            return Err(ConfigError::InvalidChunkLimit(chunk_limit));
        }

        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::InvalidTemperature(self.default_temperature));
        }

        if self.bot.reply_all
            && self
                .bot
                .reply_channel_id
                .as_deref()
                .map_or(true, |id| id.trim().is_empty())
        {
            return Err(ConfigError::ReplyChannelMissing);
        }

        if self.gateway.host.trim().is_empty() {
            return Err(ConfigError::EmptyGatewayHost);
        }

        Ok(())
    }
}

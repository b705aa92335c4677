pub mod schema;

pub use schema::{
    resolve_config_dir, BotConfig, Config, ConfigError, ConversationConfig, DeliveryConfig,
    DiscordConfig, GatewayConfig, ProviderEntryConfig, ReliabilityConfig, ReplyMode,
    MAX_CHUNK_LIMIT, PLATFORM_MAX_MESSAGE_CHARS,
};

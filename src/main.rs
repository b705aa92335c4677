#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use duobot::channels::{self, delivery::paginate, OutboundReply};
use duobot::config::Config;
use duobot::providers::{self, ChatMessage};
use duobot::ConfigCommands;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// `duobot` - Discord relay to a failover chain of AI providers.
#[derive(Parser, Debug)]
#[command(name = "duobot")]
#[command(version)]
#[command(about = "Discord bot answering through a failover chain of AI providers.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: ~/.duobot)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to Discord and serve the health endpoint
    #[command(long_about = "\
Connect to Discord and serve the health endpoint.

Requires DISCORD_BOT_TOKEN (or [discord].bot_token). Providers without a \
resolvable API key are skipped; if none remain, every reply is the \
configured fallback message.

Examples:
  duobot start
  DUOBOT_REPLY_MODE=broadcast duobot start
  PORT=8080 duobot start")]
    Start,

    /// Send one message through the provider chain and print the reply
    #[command(long_about = "\
Send one message through the provider chain and print the reply.

The reply is chunked and paginated exactly as it would be on Discord.

Examples:
  duobot ask -m \"What is a borrow checker?\"
  duobot ask -m \"Compare yourselves\" --broadcast")]
    Ask {
        /// Message text
        #[arg(short, long)]
        message: String,

        /// Ask every provider concurrently instead of the first that answers
        #[arg(long)]
        broadcast: bool,
    },

    /// List providers in fallback order and whether a credential resolved
    Providers,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(dir) = &cli.config_dir {
        if dir.as_os_str().is_empty() {
            bail!("--config-dir cannot be empty");
        }
    }

    // A missing .env is normal in hosted deployments.
    dotenvy::dotenv().ok();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load(cli.config_dir.as_deref()).await?;

    match cli.command {
        Commands::Start => channels::start_bot(config).await,

        Commands::Ask { message, broadcast } => ask(&config, &message, broadcast).await,

        Commands::Providers => {
            let statuses = providers::provider_statuses(&config)?;
            println!("Providers (fallback order):");
            for (index, status) in statuses.iter().enumerate() {
                let credential = if status.has_credential {
                    "✅ credential"
                } else {
                    "❌ no credential (skipped)"
                };
                println!(
                    "  {:>2}. {:<12} {:<36} {credential}",
                    index + 1,
                    status.kind.to_string(),
                    status.model
                );
            }
            Ok(())
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
            ConfigCommands::Show => {
                println!("# {}", config.config_path.display());
                println!("{}", toml::to_string_pretty(&config.redacted())?);
                Ok(())
            }
        },
    }
}

/// One-shot request through the engine; prints each outbound chunk.
async fn ask(config: &Config, message: &str, broadcast: bool) -> Result<()> {
    let message = message.trim();
    if message.is_empty() {
        bail!("--message cannot be empty");
    }

    let engine = channels::build_engine(config)?;
    let mut request = Vec::with_capacity(2);
    if let Some(prompt) = config.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        request.push(ChatMessage::system(prompt));
    }
    request.push(ChatMessage::user(message));

    let replies: Vec<OutboundReply> = if broadcast {
        engine
            .broadcast(&request)
            .await
            .into_iter()
            .map(|(name, result)| {
                OutboundReply::new("cli", channels::broadcast_body(&name, &result.text))
                    .with_label(name)
            })
            .collect()
    } else {
        let result = engine.complete(&request).await;
        if result.succeeded {
            tracing::info!(provider = %result.provider_name, "Answered");
        }
        vec![OutboundReply::new("cli", result.text)]
    };

    if replies.is_empty() {
        println!("{}", engine.options().fallback_message);
        return Ok(());
    }

    for reply in &replies {
        for chunk in paginate(reply, config.delivery.chunk_limit) {
            println!("{}", chunk.text);
            if !chunk.is_final {
                println!("---");
            }
        }
        println!();
    }
    Ok(())
}

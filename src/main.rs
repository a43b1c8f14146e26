//! Rocket.Chat realtime command-line client
//!
//! ## Usage
//!
//! ```bash
//! # List the rooms the user belongs to
//! rocketchat-realtime --url wss://chat.example.org/websocket \
//!     --username bot --password secret channels
//!
//! # Post into a room (or a thread)
//! rocketchat-realtime send GENERAL "hello" --thread <message-id>
//!
//! # React to a message
//! rocketchat-realtime react <message-id> :thumbsup:
//!
//! # Print messages as they arrive until the connection drops
//! rocketchat-realtime watch GENERAL
//!
//! # Write the effective settings to a config file
//! rocketchat-realtime --username bot --token <token> write-config ~/.config/rocketchat-realtime/config.toml
//! ```
//!
//! Settings come from the config file (`--config`, or the default path when it
//! exists), then `ROCKETCHAT_*` environment variables, then flags.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rocketchat_realtime::config::default_config_path;
use rocketchat_realtime::{Config, RocketChat};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rocketchat-realtime")]
#[command(about = "Talk to a Rocket.Chat server over its realtime API")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Realtime API WebSocket URL
    #[arg(long, env = "ROCKETCHAT_URL")]
    url: Option<String>,

    /// Login name or email
    #[arg(short, long, env = "ROCKETCHAT_USERNAME")]
    username: Option<String>,

    /// Password
    #[arg(short, long, env = "ROCKETCHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Resume token (used instead of the password)
    #[arg(short, long, env = "ROCKETCHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the rooms the user is a member of
    Channels,

    /// Send a message to a room
    Send {
        /// Room id
        channel: String,
        /// Message text
        text: String,
        /// Parent message id, to reply in a thread
        #[arg(long)]
        thread: Option<String>,
    },

    /// Toggle a reaction on a message
    React {
        /// Message id
        message_id: String,
        /// Emoji, e.g. :thumbsup:
        emoji: String,
    },

    /// Print a room's messages until the connection is lost
    Watch {
        /// Room id
        channel: String,
    },

    /// Write the effective configuration to a file
    WriteConfig {
        path: PathBuf,
    },
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Config::load(&path)
                        .with_context(|| format!("Failed to load config {}", path.display()))?
                } else {
                    Config::default()
                }
            }
        };

        // Apply CLI / environment overrides
        if let Some(url) = &self.url {
            config.server_url = url.clone();
        }
        if let Some(username) = &self.username {
            config.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("rocketchat_realtime=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.load_config()?;

    if let Command::WriteConfig { path } = &args.command {
        config
            .save(path)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        info!(path = %path.display(), "Wrote config");
        return Ok(());
    }

    let credentials = config.credentials()?;
    info!(url = %config.server_url, username = %credentials.username(), "Connecting");
    let chat = RocketChat::establish(config.session_config(), credentials).await?;

    match args.command {
        Command::Channels => {
            for channel in chat.get_channels().await? {
                println!("{}\t{:?}", channel.id, channel.kind);
            }
        }
        Command::Send {
            channel,
            text,
            thread,
        } => {
            let message_id = chat
                .send_message(&text, &channel, thread.as_deref())
                .await?;
            println!("{}", message_id);
        }
        Command::React { message_id, emoji } => {
            chat.send_reaction(&message_id, &emoji).await?;
        }
        Command::Watch { channel } => {
            chat.subscribe_to_channel_messages(&channel, |message| {
                let sender = message
                    .sender_username
                    .as_deref()
                    .unwrap_or(&message.sender_id);
                match &message.thread_id {
                    Some(thread) => println!("[{}] {}: {}", thread, sender, message.text),
                    None => println!("{}: {}", sender, message.text),
                }
            })
            .await?;
            info!(channel = %channel, "Watching. Press Ctrl+C to stop.");

            tokio::select! {
                closed = chat.run_forever() => {
                    warn!(error = %closed, "Connection lost");
                    return Err(closed.into());
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                }
            }
        }
        Command::WriteConfig { .. } => {}
    }

    Ok(())
}

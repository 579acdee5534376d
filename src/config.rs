//! Constants and runtime configuration for the sync core.

use std::time::Duration;

use clap::Parser;

/// First reconnect delay after a live-channel drop.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Ceiling for the reconnect delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Per-request timeout for resolver and history calls. A timeout is treated
/// exactly like a server error.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Outer bound on one history fetch, including decode.
pub const DEFAULT_HISTORY_TIMEOUT: Duration = Duration::from_secs(15);
/// Feed-event broadcast capacity; slow subscribers see lag, not blockage.
pub const EVENTS_CHANNEL_CAPACITY: usize = 256;

/// Tail a user's live notification feed.
///
/// Synchronizes the pulled history with the pushed event stream and prints
/// every feed change until interrupted. Configuration can be set via CLI
/// arguments or environment variables; CLI arguments take precedence.
#[derive(Parser, Debug)]
#[command(name = "murmur-tail", version, about)]
pub struct Cli {
    /// REST backend base URL [env: MURMUR_API_URL] [default: http://127.0.0.1:8080]
    #[arg(long, short = 'a')]
    pub api_url: Option<String>,

    /// Push gateway WebSocket URL [env: MURMUR_PUSH_URL] [default: ws://127.0.0.1:8080/push]
    #[arg(long, short = 'p')]
    pub push_url: Option<String>,

    /// User id whose feed to synchronize [env: MURMUR_USER]
    #[arg(long, short = 'u')]
    pub user: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(what) => write!(f, "missing configuration: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub struct Config {
    pub api_url: String,
    pub push_url: String,
    pub user_id: String,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, ConfigError> {
        let api_url = cli
            .api_url
            .or_else(|| std::env::var("MURMUR_API_URL").ok())
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let push_url = cli
            .push_url
            .or_else(|| std::env::var("MURMUR_PUSH_URL").ok())
            .unwrap_or_else(|| "ws://127.0.0.1:8080/push".to_string());

        let user_id = cli
            .user
            .or_else(|| std::env::var("MURMUR_USER").ok())
            .ok_or(ConfigError::Missing("user id (--user or MURMUR_USER)"))?;

        Ok(Self {
            api_url,
            push_url,
            user_id,
        })
    }
}

//! Configuration management

use anyhow::{anyhow, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::bot::{BotMode, OPENAI_API_URL};
use crate::store::DEFAULT_BOT_EMAIL;

/// Development fallback for `JWT_SECRET`
const DEFAULT_JWT_SECRET: &str = "secret";

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the WebSocket listener
    pub bind_addr: IpAddr,

    /// Listener port
    pub port: u16,

    /// HS256 secret shared with the token issuer
    pub jwt_secret: String,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Bot backend (off, heuristic, ai)
    pub bot_mode: BotMode,

    /// OpenAI API key (ai mode)
    pub openai_api_key: Option<String>,

    /// Chat-completions endpoint
    pub openai_api_url: String,

    /// Model used in ai mode
    pub openai_model: String,

    /// Max tokens per bot reply
    pub bot_max_tokens: u32,

    /// Deadline for one bot reply
    pub bot_timeout: Duration,

    /// Deadline for one store call
    pub store_timeout: Duration,

    /// Interval between keep-alive pings
    pub ping_interval: Duration,

    /// Grace period for a pong before the peer is dropped
    pub pong_timeout: Duration,

    /// Email of the user the bot posts as
    pub bot_email: String,

    /// Emit JSON logs
    pub log_json: bool,

    /// Trace HTTP requests
    pub log_requests: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            db_path: PathBuf::from("chat.db"),
            bot_mode: BotMode::Ai,
            openai_api_key: None,
            openai_api_url: OPENAI_API_URL.to_string(),
            openai_model: "gpt-3.5-turbo".to_string(),
            bot_max_tokens: 200,
            bot_timeout: Duration::from_secs(20),
            store_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            bot_email: DEFAULT_BOT_EMAIL.to_string(),
            log_json: false,
            log_requests: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind_addr = std::env::var("CHAT_RELAY_BIND_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_addr);

        let port = std::env::var("CHAT_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);

        let jwt_secret = std::env::var("JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.jwt_secret);

        let db_path = std::env::var("CHAT_RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let bot_mode = match std::env::var("BOT_MODE") {
            Ok(mode) => mode.parse::<BotMode>().map_err(|e| anyhow!(e))?,
            Err(_) => defaults.bot_mode,
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());

        let openai_api_url = std::env::var("OPENAI_API_URL").unwrap_or(defaults.openai_api_url);

        let openai_model = std::env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model);

        let bot_max_tokens = std::env::var("BOT_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bot_max_tokens);

        let bot_timeout = std::env::var("BOT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.bot_timeout);

        let store_timeout = std::env::var("STORE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.store_timeout);

        let ping_interval = std::env::var("WS_PING_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.ping_interval);

        let pong_timeout = std::env::var("WS_PONG_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.pong_timeout);

        let bot_email = std::env::var("BOT_USER_EMAIL").unwrap_or(defaults.bot_email);

        let log_json = std::env::var("CHAT_RELAY_LOG_JSON")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.log_json);

        let log_requests = std::env::var("CHAT_RELAY_LOG_REQUESTS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.log_requests);

        Ok(Self {
            bind_addr,
            port,
            jwt_secret,
            db_path,
            bot_mode,
            openai_api_key,
            openai_api_url,
            openai_model,
            bot_max_tokens,
            bot_timeout,
            store_timeout,
            ping_interval,
            pong_timeout,
            bot_email,
            log_json,
            log_requests,
        })
    }

    /// Settings that are only fit for development
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.jwt_secret == DEFAULT_JWT_SECRET {
            warnings.push("No JWT_SECRET configured - using default secret (development only)");
        }
        warnings
    }

    /// Socket address to listen on
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

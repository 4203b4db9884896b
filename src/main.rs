//! Chat Relay - Entry Point
//!
//! Modes:
//! - Default: WebSocket relay server
//! - --init-db: create the database schema and bot user, then exit

use chat_relay::{bot, Config, Dispatcher, DispatcherConfig, JwtVerifier, RelayServer, SqliteStore};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let init_db_mode = args.iter().any(|a| a == "--init-db");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Chat Relay v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: chat-relay [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --init-db    Create database schema and bot user, then exit");
        println!("  --help, -h   Show this help");
        println!();
        println!("Environment variables:");
        println!("  CHAT_RELAY_BIND_ADDR   Bind address (default: 0.0.0.0)");
        println!("  CHAT_RELAY_PORT        Listener port (default: 8080)");
        println!("  CHAT_RELAY_DB_PATH     SQLite database (default: chat.db)");
        println!("  JWT_SECRET             HS256 token secret");
        println!("  BOT_MODE               off | heuristic | ai (default: ai)");
        println!("  OPENAI_API_KEY         API key for ai mode");
        println!("  OPENAI_API_URL         Chat-completions endpoint for ai mode");
        println!("  OPENAI_MODEL           Model for ai mode (default: gpt-3.5-turbo)");
        println!("  BOT_MAX_TOKENS         Reply length cap for ai mode (default: 200)");
        println!("  BOT_USER_EMAIL         Email of the bot user (default: bot@local)");
        println!("  BOT_TIMEOUT_SECS       Bot reply deadline (default: 20)");
        println!("  STORE_TIMEOUT_SECS     Store call deadline (default: 5)");
        println!("  WS_PING_INTERVAL_SECS  Keep-alive ping interval (default: 30)");
        println!("  WS_PONG_TIMEOUT_SECS   Pong grace period (default: 10)");
        println!("  CHAT_RELAY_LOG_JSON    Emit JSON logs (default: false)");
        println!("  CHAT_RELAY_LOG_REQUESTS  Trace HTTP requests (default: true)");
        return Ok(());
    }

    let config = Config::from_env()?;

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let store = Arc::new(SqliteStore::open(&config.db_path, &config.bot_email)?);

    if init_db_mode {
        let bot_principal = store.ensure_bot_user()?;
        info!(
            "Database initialised at {} (bot user {})",
            config.db_path.display(),
            bot_principal
        );
        return Ok(());
    }

    info!("Chat Relay v{}", env!("CARGO_PKG_VERSION"));

    let dispatcher = Dispatcher::new(
        Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes())),
        store.clone(),
        store,
        bot::oracle_from_config(&config),
    )
    .with_config(DispatcherConfig::from(&config));

    RelayServer::new(config, dispatcher).run().await?;

    Ok(())
}

//! Conversation Bot
//!
//! Reply generators behind the [`BotOracle`] trait.
//!
//! - `off`: never replies
//! - `heuristic`: keyword reply, otherwise echoes a prefix of the message
//! - `ai`: OpenAI chat completion with the message as the single user turn
//!
//! Failures are reported as [`BotError`]; the dispatcher swallows them.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::ConversationId;

/// Default chat-completions endpoint
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Characters of the incoming message echoed by the heuristic bot
const HEURISTIC_ECHO_CHARS: usize = 140;

const HOURS_KEYWORD: &str = "horário";
const HOURS_REPLY: &str = "Meu horário de atendimento é 9h-18h.";

/// Bot errors
#[derive(Debug, Error)]
pub enum BotError {
    #[error("Bot backend not configured")]
    NotConfigured,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bot API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Bot reply timed out")]
    Timeout,
}

/// Produces an optional automated reply for a message
#[async_trait]
pub trait BotOracle: Send + Sync {
    async fn generate_reply(
        &self,
        content: &str,
        conversation_id: ConversationId,
    ) -> Result<Option<String>, BotError>;
}

/// Bot backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotMode {
    Off,
    Heuristic,
    Ai,
}

impl BotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heuristic => "heuristic",
            Self::Ai => "ai",
        }
    }
}

impl FromStr for BotMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "heuristic" => Ok(Self::Heuristic),
            "ai" => Ok(Self::Ai),
            other => Err(format!("unknown bot mode: {}", other)),
        }
    }
}

/// Build the oracle selected by the configuration
pub fn oracle_from_config(config: &Config) -> Arc<dyn BotOracle> {
    info!("Bot mode: {}", config.bot_mode.as_str());

    match config.bot_mode {
        BotMode::Off => Arc::new(DisabledBot),
        BotMode::Heuristic => Arc::new(HeuristicBot),
        BotMode::Ai => {
            let bot = OpenAiBot::new(
                config.openai_api_key.as_deref(),
                &config.openai_model,
                config.bot_max_tokens,
            )
            .with_api_url(config.openai_api_url.clone());

            if !bot.is_available() {
                warn!("BOT_MODE=ai without OPENAI_API_KEY - bot replies will be skipped");
            }
            Arc::new(bot)
        }
    }
}

/// Never replies
pub struct DisabledBot;

#[async_trait]
impl BotOracle for DisabledBot {
    async fn generate_reply(&self, _content: &str, _conversation_id: ConversationId) -> Result<Option<String>, BotError> {
        Ok(None)
    }
}

/// Keyword-driven replies, no network
pub struct HeuristicBot;

impl HeuristicBot {
    pub fn reply_to(content: &str) -> String {
        let lowered = content.to_lowercase();
        if lowered.contains(HOURS_KEYWORD) {
            return HOURS_REPLY.to_string();
        }

        let echoed: String = content.chars().take(HEURISTIC_ECHO_CHARS).collect();
        format!("Bot (heuristic): {}", echoed)
    }
}

#[async_trait]
impl BotOracle for HeuristicBot {
    async fn generate_reply(&self, content: &str, _conversation_id: ConversationId) -> Result<Option<String>, BotError> {
        Ok(Some(Self::reply_to(content)))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// OpenAI chat-completions client
#[derive(Clone)]
pub struct OpenAiBot {
    client: Client,
    api_key: Option<String>,
    api_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiBot {
    pub fn new(api_key: Option<&str>, model: &str, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.map(|s| s.to_string()),
            api_url: OPENAI_API_URL.to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }

    /// Point at an OpenAI-compatible endpoint
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Check if API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl BotOracle for OpenAiBot {
    async fn generate_reply(
        &self,
        content: &str,
        conversation_id: ConversationId,
    ) -> Result<Option<String>, BotError> {
        let api_key = self.api_key.as_ref().ok_or(BotError::NotConfigured)?;

        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: content.to_string(),
            }],
            max_tokens: self.max_tokens,
        };

        debug!(conversation_id, model = %self.model, prompt_len = content.len(), "Calling bot API");

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Api { status, body });
        }

        let result: CompletionResponse = response.json().await?;
        let reply = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty());

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_mode_parse() {
        assert_eq!("off".parse::<BotMode>().unwrap(), BotMode::Off);
        assert_eq!(" Heuristic ".parse::<BotMode>().unwrap(), BotMode::Heuristic);
        assert_eq!("AI".parse::<BotMode>().unwrap(), BotMode::Ai);
        assert!("gpt".parse::<BotMode>().is_err());
    }

    #[test]
    fn test_heuristic_hours_keyword() {
        assert_eq!(
            HeuristicBot::reply_to("Qual o horário?"),
            "Meu horário de atendimento é 9h-18h."
        );
        assert_eq!(
            HeuristicBot::reply_to("HORÁRIO de sábado"),
            "Meu horário de atendimento é 9h-18h."
        );
        assert!(HeuristicBot::reply_to("What are your hours?").starts_with("Bot (heuristic): "));
    }

    #[test]
    fn test_heuristic_echo_truncates_on_chars() {
        let long = "é".repeat(200);
        let reply = HeuristicBot::reply_to(&long);

        assert!(reply.starts_with("Bot (heuristic): "));
        assert_eq!(reply.chars().count(), "Bot (heuristic): ".len() + HEURISTIC_ECHO_CHARS);
    }

    #[tokio::test]
    async fn test_disabled_bot_never_replies() {
        assert!(DisabledBot.generate_reply("hello", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_openai_without_key_is_not_configured() {
        let bot = OpenAiBot::new(None, "gpt-3.5-turbo", 200);

        assert!(!bot.is_available());
        assert!(matches!(
            bot.generate_reply("hello", 1).await,
            Err(BotError::NotConfigured)
        ));
    }
}

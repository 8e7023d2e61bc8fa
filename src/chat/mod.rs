//! Text-chat variant
//!
//! Swaps the whole voice stack for a Telegram bot while keeping the tool
//! surface identical: the operator answers in a chat window instead of on
//! a handset. `mod.rs` is the Bot API client; `engine.rs` holds the
//! session logic and the long-poll coordination.
//!
//! # Setup
//!
//! 1. Create a bot via @BotFather on Telegram
//! 2. Put the token in `TELEGRAM_BOT_TOKEN`
//! 3. Put the operator's chat id in `TELEGRAM_CHAT_ID`

pub mod engine;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CallError, CallResult};

pub use engine::ChatEngine;

/// Telegram API base URL
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// The marker Telegram puts in 400 responses for broken Markdown
const PARSE_ENTITY_MARKER: &str = "can't parse entities";

/// Telegram Bot API client
#[derive(Debug, Clone)]
pub struct TelegramClient {
    bot_token: String,
    api_base: String,
    http_client: reqwest::Client,
}

/// Generic Bot API response envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// An incoming update from long polling
#[derive(Debug, Clone, Deserialize)]
pub struct ChatUpdate {
    pub update_id: i64,
    pub message: Option<ChatMessage>,
}

/// An incoming message
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub text: Option<String>,
    pub chat: ChatRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRef {
    pub id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest {
    offset: i64,
    timeout: u64,
    limit: u32,
}

impl TelegramClient {
    pub fn new(bot_token: String) -> Self {
        // Long polls hold the connection open for up to the requested
        // timeout; give the client headroom beyond it.
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(90))
            .build()
            .expect("failed to build HTTP client");

        Self {
            bot_token,
            api_base: TELEGRAM_API_BASE.to_string(),
            http_client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Send a text message, preferring Markdown.
    ///
    /// Telegram rejects unbalanced markup with a 400 whose description
    /// carries a recognizable marker; that specific failure gets a single
    /// plain-text retry.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> CallResult<()> {
        match self.send_with_mode(chat_id, text, Some("Markdown")).await {
            Ok(()) => Ok(()),
            Err(CallError::Provider { message, .. }) if message.contains(PARSE_ENTITY_MARKER) => {
                debug!("markdown rejected, retrying as plain text");
                self.send_with_mode(chat_id, text, None).await
            }
            Err(e) => Err(e),
        }
    }

    async fn send_with_mode(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> CallResult<()> {
        let request = SendMessageRequest { chat_id, text, parse_mode };

        let response: ApiResponse<serde_json::Value> = self
            .http_client
            .post(self.api_url("sendMessage"))
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::provider("telegram", e.to_string()))?
            .json()
            .await
            .map_err(|e| CallError::provider("telegram", format!("bad response: {e}")))?;

        if response.ok {
            Ok(())
        } else {
            let description = response
                .description
                .unwrap_or_else(|| "unknown error".to_string());
            warn!("sendMessage failed: {description}");
            Err(CallError::provider("telegram", description))
        }
    }

    /// Long-poll for updates at `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> CallResult<Vec<ChatUpdate>> {
        let request = GetUpdatesRequest { offset, timeout: timeout_secs, limit: 100 };

        let response: ApiResponse<Vec<ChatUpdate>> = self
            .http_client
            .post(self.api_url("getUpdates"))
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::provider("telegram", e.to_string()))?
            .json()
            .await
            .map_err(|e| CallError::provider("telegram", format!("bad response: {e}")))?;

        if response.ok {
            Ok(response.result.unwrap_or_default())
        } else {
            Err(CallError::provider(
                "telegram",
                response
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

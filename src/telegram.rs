//! Telegram transport.
//!
//! Long-polls the Bot API on a spawned task and pushes each text message
//! into the engine through an [`EventSink`]. Replies go back out via
//! `sendMessage`, addressed by chat id. Uses the existing `reqwest` client,
//! no bot framework.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::TelegramConfig;
use crate::engine::{EventSink, Transport};
use crate::error::{DoppelError, Result};

pub const TRANSPORT_NAME: &str = "telegram";

// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_LEN: usize = 4096;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Deserialize)]
struct BotInfo {
    username: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Deserialize)]
struct TelegramUser {
    username: Option<String>,
    first_name: Option<String>,
}

// ─── Transport ───────────────────────────────────────────────────────────────

pub struct TelegramTransport {
    allowed_chat_ids: Vec<i64>,
    sink: EventSink,
    client: reqwest::Client,
    api_base: String,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramTransport {
    /// Errors when the config carries no bot token.
    pub fn new(config: &TelegramConfig, sink: EventSink) -> Result<Self> {
        let token = match &config.token {
            Some(token) if !token.trim().is_empty() => token.trim().to_string(),
            _ => {
                return Err(DoppelError::Config(
                    "telegram transport requires a bot token".to_string(),
                ))
            }
        };
        let api_base = format!("https://api.telegram.org/bot{}", token);

        Ok(Self {
            allowed_chat_ids: config.allowed_chat_ids.clone(),
            sink,
            client: reqwest::Client::new(),
            api_base,
            poller: Mutex::new(None),
        })
    }

}

/// Empty allow-list accepts every chat.
fn chat_allowed(allowed: &[i64], chat_id: i64) -> bool {
    allowed.is_empty() || allowed.contains(&chat_id)
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    /// Verifies the token via `getMe`, then spawns the long-poll loop.
    async fn start(&self) -> Result<()> {
        let url = format!("{}/getMe", self.api_base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DoppelError::transport(TRANSPORT_NAME, e))?;
        let body: TelegramResponse<BotInfo> = response
            .json()
            .await
            .map_err(|e| DoppelError::transport(TRANSPORT_NAME, e))?;
        if !body.ok {
            return Err(DoppelError::transport(
                TRANSPORT_NAME,
                "getMe returned ok=false, check the bot token",
            ));
        }
        let username = body
            .result
            .and_then(|info| info.username)
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!(
            "Telegram bot @{} active (allowed chats: {:?})",
            username,
            self.allowed_chat_ids
        );

        let handle = tokio::spawn(poll_loop(
            self.client.clone(),
            self.api_base.clone(),
            self.allowed_chat_ids.clone(),
            self.sink.clone(),
        ));
        *self.poller.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.poller.lock().await.take() {
            handle.abort();
            tracing::info!("Telegram poller stopped");
        }
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<bool> {
        let chat_id: i64 = recipient.parse().map_err(|_| {
            DoppelError::transport(TRANSPORT_NAME, format!("invalid chat id {:?}", recipient))
        })?;

        let text = truncate_message(text);
        let url = format!("{}/sendMessage", self.api_base);
        let payload = serde_json::json!({ "chat_id": chat_id, "text": text });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DoppelError::transport(TRANSPORT_NAME, e))?;
        if response.status().is_success() {
            tracing::debug!("Telegram: sent reply to chat {}", chat_id);
            Ok(true)
        } else {
            tracing::warn!("Telegram sendMessage failed: HTTP {}", response.status());
            Ok(false)
        }
    }
}

// ─── Poll loop ───────────────────────────────────────────────────────────────

async fn poll_loop(
    client: reqwest::Client,
    api_base: String,
    allowed_chat_ids: Vec<i64>,
    sink: EventSink,
) {
    let mut offset: i64 = 0;

    loop {
        let updates = match poll_updates(&client, &api_base, offset).await {
            Some(updates) => updates,
            None => continue,
        };

        for update in updates {
            offset = update.update_id + 1;

            let Some(message) = update.message else {
                continue;
            };
            let chat_id = message.chat.id;

            if !chat_allowed(&allowed_chat_ids, chat_id) {
                tracing::debug!("Telegram: ignoring message from unauthorized chat {}", chat_id);
                continue;
            }

            let text = match message.text {
                Some(text) if !text.trim().is_empty() => text.trim().to_string(),
                _ => continue,
            };

            tracing::info!("Telegram [chat {}]: {:?}", chat_id, text);

            let meta = match &message.from {
                Some(user) => serde_json::json!({
                    "username": user.username,
                    "first_name": user.first_name,
                }),
                None => serde_json::Value::Null,
            };

            // Chat id doubles as the sender so replies can be addressed back.
            sink.emit(chat_id.to_string(), text, meta);
        }
    }
}

async fn poll_updates(
    client: &reqwest::Client,
    api_base: &str,
    offset: i64,
) -> Option<Vec<Update>> {
    let url = format!("{}/getUpdates", api_base);
    let params = serde_json::json!({
        "offset": offset,
        "timeout": 30,
        "allowed_updates": ["message"]
    });

    let response = match client.post(&url).json(&params).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Telegram getUpdates error: {}", e);
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    let body: TelegramResponse<Vec<Update>> = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Telegram getUpdates parse error: {}", e);
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    if !body.ok {
        tracing::warn!("Telegram API returned ok=false");
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        return None;
    }

    Some(body.result.unwrap_or_default())
}

/// Cut at the last char boundary that fits the API limit.
fn truncate_message(text: &str) -> &str {
    if text.len() <= MAX_MESSAGE_LEN {
        return text;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

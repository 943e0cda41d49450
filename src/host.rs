//! Host-runtime seam.
//!
//! The bridge runs inside a larger agent host. Two host capabilities are
//! exercised: delivering a message to a chat channel, and enqueuing a system
//! event for the agent's next turn. Both sit behind one trait so tests can
//! substitute a recording fake.

use crate::error::Result;
use anyhow::Context as _;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// Deliver `text` to a chat channel. `chat_id` is channel-native
    /// (for Telegram, the numeric chat id as a string).
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Enqueue a system event for the next agent turn. Redelivery with the
    /// same `context_key` must be a no-op on the host side.
    async fn enqueue_system_event(
        &self,
        text: &str,
        session_key: &str,
        context_key: &str,
    ) -> Result<()>;
}

/// Telegram-backed host runtime using the Bot API.
pub struct TelegramHost {
    bot_token: String,
    http: reqwest::Client,
    /// Enqueue endpoint of the host gateway, e.g. `http://127.0.0.1:3001/events`.
    enqueue_url: Option<String>,
}

impl TelegramHost {
    pub fn new(bot_token: String, enqueue_url: Option<String>) -> Self {
        Self {
            bot_token,
            http: reqwest::Client::new(),
            enqueue_url,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }
}

#[async_trait]
impl HostRuntime for TelegramHost {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown"
            }))
            .send()
            .await?;

        if resp.status().is_success() {
            let data: serde_json::Value = resp.json().await?;
            if data["ok"].as_bool() == Some(true) {
                return Ok(());
            }
        }
        Err(crate::error::Error::other("Telegram send failed"))
    }

    async fn enqueue_system_event(
        &self,
        text: &str,
        session_key: &str,
        context_key: &str,
    ) -> Result<()> {
        let Some(url) = &self.enqueue_url else {
            debug!(context_key, "no enqueue endpoint configured, dropping system event");
            return Ok(());
        };
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "text": text,
                "sessionKey": session_key,
                "contextKey": context_key,
            }))
            .send()
            .await
            .context("enqueue system event")
            .map_err(|e| crate::error::Error::other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(crate::error::Error::ProviderError {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// In-memory host runtime that records every delivery. Used by tests and
/// the mock-provider CLI path.
#[derive(Default)]
pub struct RecordingHost {
    pub sent: Mutex<Vec<(String, String)>>,
    pub enqueued: Mutex<Vec<(String, String, String)>>,
    /// When true, `send_message` fails so delivery fallbacks can be tested.
    pub fail_sends: bool,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostRuntime for RecordingHost {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if self.fail_sends {
            return Err(crate::error::Error::other("send disabled"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn enqueue_system_event(
        &self,
        text: &str,
        session_key: &str,
        context_key: &str,
    ) -> Result<()> {
        let mut enqueued = self.enqueued.lock().unwrap();
        // Same contextKey twice is a host-side no-op.
        if enqueued.iter().any(|(_, _, key)| key == context_key) {
            return Ok(());
        }
        enqueued.push((
            text.to_string(),
            session_key.to_string(),
            context_key.to_string(),
        ));
        Ok(())
    }
}

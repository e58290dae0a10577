//! Telegram channel: long-poll getUpdates and sendMessage via Bot API.

use crate::channels::inbound::Incoming;
use crate::channels::registry::ChannelHandle;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
pub const TELEGRAM_TRANSPORT_ID: &str = "telegram";

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

impl TelegramUpdate {
    /// Text message carried by this update, if any. Empty and non-text messages are skipped.
    pub fn into_incoming(self) -> Option<Incoming> {
        let msg = self.message?;
        let text = msg.text.filter(|t| !t.trim().is_empty())?;
        let author_id = msg
            .from
            .map(|u| {
                u.username
                    .filter(|s| !s.is_empty())
                    .or(u.first_name.filter(|s| !s.is_empty()))
                    .unwrap_or_else(|| u.id.to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Some(Incoming {
            transport: TELEGRAM_TRANSPORT_ID.to_string(),
            channel_id: msg.chat.id.to_string(),
            author_id,
            text,
        })
    }
}

/// Telegram channel connector: long-polls for updates and sends replies via sendMessage.
pub struct TelegramChannel {
    id: String,
    token: Option<String>,
    api_base: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: Option<String>) -> Self {
        Self {
            id: TELEGRAM_TRANSPORT_ID.to_string(),
            token,
            api_base: telegram_api_base(),
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn method_url(&self, method: &str) -> Result<String, String> {
        let token = self
            .token
            .as_ref()
            .ok_or("telegram bot token not configured")?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }

    /// Start the getUpdates long-poll loop and forward messages to the gateway. Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, inbound_tx: mpsc::Sender<Incoming>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let mut url = format!("{}?timeout={}", self.method_url("getUpdates")?, LONG_POLL_TIMEOUT);
        if let Some(off) = offset {
            url = format!("{}&offset={}", url, off);
        }
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: GetUpdatesResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getUpdates returned ok: false".to_string());
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    async fn post_method(&self, method: &str, body: serde_json::Value) -> Result<(), String> {
        let url = self.method_url(method)?;
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("{} failed: {} {}", method, status, body));
        }
        Ok(())
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), String> {
        let mut body = serde_json::json!({ "url": url });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        self.post_method("setWebhook", body).await
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<(), String> {
        self.post_method("deleteWebhook", serde_json::json!({})).await
    }

    /// Send a text message to a chat via sendMessage API.
    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), String> {
        self.post_method(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text }),
        )
        .await
    }
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, inbound_tx: mpsc::Sender<Incoming>) {
    let mut offset: Option<i64> = None;
    while channel.running() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next.or(offset);
                for u in updates {
                    let Some(incoming) = u.into_incoming() else {
                        continue;
                    };
                    if inbound_tx.send(incoming).await.is_err() {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), String> {
        self.send_text(channel_id, text).await
    }
}

/// Telegram bot API base URL; TELEGRAM_API_BASE overrides it (for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE")
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> TelegramUpdate {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn text_update_becomes_incoming_with_username() {
        let u = update(
            r#"{"update_id":7,"message":{"chat":{"id":-100},"from":{"id":5,"username":"ana","first_name":"Ana"},"text":"hello"}}"#,
        );
        let incoming = u.into_incoming().unwrap();
        assert_eq!(incoming.transport, "telegram");
        assert_eq!(incoming.channel_id, "-100");
        assert_eq!(incoming.author_id, "ana");
        assert_eq!(incoming.text, "hello");
    }

    #[test]
    fn author_falls_back_to_first_name_then_id() {
        let named = update(
            r#"{"update_id":1,"message":{"chat":{"id":1},"from":{"id":5,"first_name":"Ana"},"text":"x"}}"#,
        );
        assert_eq!(named.into_incoming().unwrap().author_id, "Ana");
        let bare = update(r#"{"update_id":1,"message":{"chat":{"id":1},"from":{"id":5},"text":"x"}}"#);
        assert_eq!(bare.into_incoming().unwrap().author_id, "5");
    }

    #[test]
    fn non_text_and_blank_updates_are_skipped() {
        assert!(update(r#"{"update_id":1}"#).into_incoming().is_none());
        assert!(update(r#"{"update_id":1,"message":{"chat":{"id":1}}}"#)
            .into_incoming()
            .is_none());
        assert!(update(r#"{"update_id":1,"message":{"chat":{"id":1},"text":"  "}}"#)
            .into_incoming()
            .is_none());
    }

    #[tokio::test]
    async fn send_without_token_fails_fast() {
        let channel = TelegramChannel::new(None);
        let err = channel.send_message("1", "hi").await.unwrap_err();
        assert!(err.contains("token"));
    }
}

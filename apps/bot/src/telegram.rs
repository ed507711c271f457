//! Minimal Telegram Bot API client: long-poll `getUpdates` for inbound
//! commands, `sendMessage` for outbound delivery. Outbound text is passed to
//! the channel as HTML markup, unescaped and unvalidated.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            bot_token: bot_token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.bot_token,
            method
        )
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let res = self
            .http
            .post(self.url("sendMessage"))
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await
            .context("telegram sendMessage request")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("telegram sendMessage {status}: {body}"));
        }
        Ok(())
    }

    /// Long-poll fetch; blocks on the Bot API side for up to `timeout_secs`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<TelegramUpdate>> {
        let res = self
            .http
            .post(self.url("getUpdates"))
            .json(&json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }))
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await
            .context("telegram getUpdates request")?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("telegram getUpdates {status}: {body}"));
        }
        let body: TelegramResponse<Vec<TelegramUpdate>> = res
            .json()
            .await
            .context("decode telegram getUpdates response")?;
        if !body.ok {
            return Err(anyhow!(
                "telegram getUpdates failed: {}",
                body.description.unwrap_or_else(|| "unknown error".into())
            ));
        }
        Ok(body.result.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_trims_trailing_slash() {
        let client = TelegramClient::new(
            reqwest::Client::new(),
            "https://api.telegram.org/",
            "token-123",
        );
        assert_eq!(
            client.url("sendMessage"),
            "https://api.telegram.org/bottoken-123/sendMessage"
        );
    }

    #[test]
    fn update_decodes_message_fields() {
        let raw = serde_json::json!({
            "update_id": 7,
            "message": {
                "chat": {"id": 123},
                "from": {"id": 99, "username": "ann", "first_name": "Ann"},
                "text": "/start"
            }
        });
        let update: TelegramUpdate = serde_json::from_value(raw).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.id, 123);
        let from = msg.from.unwrap();
        assert_eq!(from.id, 99);
        assert_eq!(from.username.as_deref(), Some("ann"));
        assert!(from.last_name.is_none());
        assert_eq!(msg.text.as_deref(), Some("/start"));
    }

    #[test]
    fn update_without_message_decodes() {
        let update: TelegramUpdate =
            serde_json::from_value(serde_json::json!({"update_id": 8})).unwrap();
        assert!(update.message.is_none());
    }
}

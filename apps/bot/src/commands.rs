//! Incoming command handling: a recognized `/start` becomes a
//! `StartCommand` event on the user-events topic, keyed by the chat id.
//! Publish failures are logged and dropped; the user gets no error back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use visor_bus::BusPublisher;
use visor_session::SharedSessionStore;

use crate::telegram::TelegramMessage;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCommandEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub chat_id: i64,
    pub bot_id: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub event_time: String,
}

/// UTC with millisecond precision and a trailing `Z`.
pub fn format_event_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn start_event(msg: &TelegramMessage, at: DateTime<Utc>) -> StartCommandEvent {
    let from = msg.from.as_ref();
    StartCommandEvent {
        kind: "StartCommand".into(),
        chat_id: msg.chat.id,
        bot_id: from.map(|user| user.id),
        username: from.and_then(|user| user.username.clone()),
        first_name: from.and_then(|user| user.first_name.clone()),
        last_name: from.and_then(|user| user.last_name.clone()),
        event_time: format_event_time(at),
    }
}

pub fn is_start_command(text: &str) -> bool {
    text == "/start" || text.starts_with("/start ") || text.starts_with("/start@")
}

pub struct CommandHandler {
    bus: Arc<dyn BusPublisher>,
    user_events_topic: String,
    sessions: SharedSessionStore,
}

impl CommandHandler {
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        user_events_topic: impl Into<String>,
        sessions: SharedSessionStore,
    ) -> Self {
        Self {
            bus,
            user_events_topic: user_events_topic.into(),
            sessions,
        }
    }

    pub async fn handle_start(&self, msg: &TelegramMessage) {
        let event = start_event(msg, Utc::now());
        let chat_id = event.chat_id;
        let value = match serde_json::to_value(&event) {
            Ok(value) => value,
            Err(err) => {
                error!(chat_id, error = %err, "failed to encode StartCommand event");
                return;
            }
        };
        match self
            .bus
            .publish(&self.user_events_topic, &chat_id.to_string(), &value)
            .await
        {
            Ok(()) => {
                info!(chat_id, "published StartCommand event");
                visor_telemetry::inc_event("start_command");
            }
            Err(err) => {
                error!(chat_id, error = %err, "failed to publish StartCommand event");
                return;
            }
        }

        // /start begins a fresh conversation.
        if let Err(err) = self.sessions.clear(chat_id).await {
            warn!(chat_id, error = %err, "failed to clear session state");
        }
        let initial = json!({"state": "started", "startedAt": event.event_time})
            .as_object()
            .cloned()
            .unwrap_or_default();
        if let Err(err) = self.sessions.set(chat_id, initial).await {
            warn!(chat_id, error = %err, "failed to store session state");
        }
    }
}

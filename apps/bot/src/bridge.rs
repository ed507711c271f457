//! Outgoing bridge: drains the bus consume stream and turns backend
//! envelopes into chat deliveries.
//!
//! Messages are processed strictly sequentially off the single stream; a
//! slow delivery stalls the stream instead of buffering. Delivery failures
//! are logged and the message is lost, the worker keeps running.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, warn};
use visor_bus::BusStream;
use visor_templates::{TemplateCatalog, render_from_body};

use crate::telegram::TelegramClient;

/// Decoded message body read from the consume stream, pre-routing.
#[derive(Debug, Clone, Deserialize)]
pub struct OutgoingEnvelope {
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub body: Option<Map<String, Value>>,
}

/// Routing decision for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Structured body rendered through the template catalog.
    Rendered { chat_id: i64, text: String },
    /// Plain text passed through untouched.
    PlainText { chat_id: i64, text: String },
    /// No routing target or nothing to send.
    Dropped,
}

/// Classifies an envelope. A non-empty `body` wins over `text`; an envelope
/// without a chat id is dropped silently.
pub fn route(catalog: &TemplateCatalog, envelope: &OutgoingEnvelope) -> RouteOutcome {
    let Some(chat_id) = envelope.chat_id else {
        return RouteOutcome::Dropped;
    };
    if let Some(body) = envelope.body.as_ref().filter(|body| !body.is_empty()) {
        return RouteOutcome::Rendered {
            chat_id,
            text: render_from_body(catalog, body),
        };
    }
    match envelope.text.as_deref() {
        Some(text) if !text.is_empty() => RouteOutcome::PlainText {
            chat_id,
            text: text.to_string(),
        },
        _ => RouteOutcome::Dropped,
    }
}

/// Worker loop; runs until the stream ends or the task is cancelled.
pub async fn run(mut stream: BusStream, telegram: TelegramClient, catalog: &TemplateCatalog) {
    while let Some((_key, payload)) = stream.next().await {
        let envelope: OutgoingEnvelope = match serde_json::from_value(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "skipping malformed outgoing envelope");
                continue;
            }
        };
        match route(catalog, &envelope) {
            RouteOutcome::Rendered { chat_id, text } => {
                deliver(&telegram, chat_id, &text, "outgoing_body").await;
            }
            RouteOutcome::PlainText { chat_id, text } => {
                deliver(&telegram, chat_id, &text, "outgoing_text").await;
            }
            RouteOutcome::Dropped => {}
        }
    }
    warn!("outgoing bridge stream ended");
}

async fn deliver(telegram: &TelegramClient, chat_id: i64, text: &str, event_type: &str) {
    let timer = visor_telemetry::time_event(event_type);
    let result = telegram.send_message(chat_id, text).await;
    timer.observe_duration();
    match result {
        Ok(()) => visor_telemetry::inc_event(event_type),
        Err(err) => error!(chat_id, error = %err, "failed to deliver message to chat"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::from_yaml("welcome: \"Hello, {{name}}!\"\n").unwrap()
    }

    fn envelope(value: Value) -> OutgoingEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn body_is_rendered_through_the_catalog() {
        let outcome = route(
            &catalog(),
            &envelope(json!({
                "chat_id": 1,
                "body": {"template": "welcome", "params": {"name": "Ann"}}
            })),
        );
        assert_eq!(
            outcome,
            RouteOutcome::Rendered {
                chat_id: 1,
                text: "Hello, Ann!".into()
            }
        );
    }

    #[test]
    fn body_takes_precedence_over_text() {
        let outcome = route(
            &catalog(),
            &envelope(json!({
                "chat_id": 1,
                "text": "ignored",
                "body": {"template": "welcome", "params": {"name": "Ann"}}
            })),
        );
        assert_eq!(
            outcome,
            RouteOutcome::Rendered {
                chat_id: 1,
                text: "Hello, Ann!".into()
            }
        );
    }

    #[test]
    fn empty_body_falls_back_to_text() {
        let outcome = route(
            &catalog(),
            &envelope(json!({"chat_id": 2, "text": "hi", "body": {}})),
        );
        assert_eq!(
            outcome,
            RouteOutcome::PlainText {
                chat_id: 2,
                text: "hi".into()
            }
        );
    }

    #[test]
    fn missing_chat_id_is_dropped() {
        let outcome = route(
            &catalog(),
            &envelope(json!({"text": "hi", "body": {"foo": "bar"}})),
        );
        assert_eq!(outcome, RouteOutcome::Dropped);
    }

    #[test]
    fn empty_envelope_is_dropped() {
        assert_eq!(route(&catalog(), &envelope(json!({"chat_id": 3}))), RouteOutcome::Dropped);
        assert_eq!(
            route(&catalog(), &envelope(json!({"chat_id": 3, "text": ""}))),
            RouteOutcome::Dropped
        );
    }

    #[test]
    fn unknown_template_body_is_stringified() {
        let outcome = route(&catalog(), &envelope(json!({"chat_id": 4, "body": {"foo": "bar"}})));
        assert_eq!(
            outcome,
            RouteOutcome::Rendered {
                chat_id: 4,
                text: r#"{"foo":"bar"}"#.into()
            }
        );
    }
}

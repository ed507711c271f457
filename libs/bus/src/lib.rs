//! Event-bus connection manager for the chat bridge.
//!
//! Publish and consume sides have independent lifecycles: the publish
//! connection is established eagerly by [`BusManager::start`] and its failure
//! is fatal to the caller, while the consume side attaches lazily on the
//! first [`BusManager::consume`] call with a bounded retry loop. Payloads are
//! compact UTF-8 JSON with non-ASCII characters preserved; the routing key
//! travels in the `Visor-Msg-Key` header.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::DeliverPolicy,
    consumer::push::{Config as PushConfig, Messages},
    stream::Config as StreamConfig,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Header carrying the partition/routing key of a bus message.
pub const MSG_KEY_HEADER: &str = "Visor-Msg-Key";

const MAX_CONSUME_ATTEMPTS: u32 = 15;
const INITIAL_BACKOFF_SECS: f64 = 1.0;
const BACKOFF_FACTOR: f64 = 1.5;
const MAX_BACKOFF_SECS: f64 = 5.0;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(#[source] anyhow::Error),
    #[error("bus publish failed: {0}")]
    Publish(#[source] anyhow::Error),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("consumer could not be started after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("bus publisher not started")]
    NotStarted,
}

/// Lifecycle of one bus direction (publish or consume).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Starting,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub servers: String,
    pub outgoing_topic: String,
    pub user_events_topic: String,
    pub consumer_group: String,
}

/// Inter-attempt delay for the consume-side connect loop.
///
/// Pure function of the attempt count (1-based): 1s initially, growing by
/// x1.5 per attempt, capped at 5s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31) as i32;
    let secs = INITIAL_BACKOFF_SECS * BACKOFF_FACTOR.powi(exp);
    Duration::from_secs_f64(secs.min(MAX_BACKOFF_SECS))
}

/// Encodes a payload for the wire: compact JSON, non-ASCII preserved.
pub fn encode_payload(value: &Value) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(value)?)
}

/// JetStream streams reject dots in their names.
fn stream_name(topic: &str) -> String {
    topic.replace('.', "-")
}

/// Publish seam shared by the command handler and any future producer.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, value: &Value) -> Result<(), BusError>;
}

struct PublishChannel {
    state: ChannelState,
    conn: Option<PublishConn>,
}

struct PublishConn {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

struct ConsumeChannel {
    state: ChannelState,
    client: Option<async_nats::Client>,
}

pub struct BusManager {
    config: BusConfig,
    publish: Mutex<PublishChannel>,
    consume: Mutex<ConsumeChannel>,
}

impl BusManager {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            publish: Mutex::new(PublishChannel {
                state: ChannelState::Uninitialized,
                conn: None,
            }),
            consume: Mutex::new(ConsumeChannel {
                state: ChannelState::Uninitialized,
                client: None,
            }),
        }
    }

    /// Establishes the publish connection and ensures the published topics
    /// are backed by a stream. Must succeed before any `publish` call.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut publish = self.publish.lock().await;
        if publish.state == ChannelState::Ready {
            return Ok(());
        }
        publish.state = ChannelState::Starting;
        let client = match async_nats::connect(&self.config.servers).await {
            Ok(client) => client,
            Err(err) => {
                publish.state = ChannelState::Failed;
                return Err(BusError::Connect(anyhow::Error::new(err)));
            }
        };
        let js = jetstream::new(client.clone());
        if let Err(err) = js
            .get_or_create_stream(StreamConfig {
                name: stream_name(&self.config.user_events_topic),
                subjects: vec![self.config.user_events_topic.clone()],
                ..Default::default()
            })
            .await
        {
            publish.state = ChannelState::Failed;
            return Err(BusError::Connect(anyhow::Error::new(err)));
        }
        info!(servers = %self.config.servers, "bus publisher started");
        publish.conn = Some(PublishConn {
            client,
            jetstream: js,
        });
        publish.state = ChannelState::Ready;
        Ok(())
    }

    /// Attaches the consume side lazily: up to 15 connect attempts separated
    /// by [`backoff_delay`], then a fatal [`BusError::Exhausted`].
    ///
    /// The durable consumer joins the configured group (`deliver_group`), so
    /// instances sharing the group name split the stream without duplicate
    /// delivery. `DeliverPolicy::New` starts a fresh group at the newest
    /// message rather than replaying the topic.
    pub async fn consume(&self) -> Result<BusStream, BusError> {
        let mut consume = self.consume.lock().await;
        consume.state = ChannelState::Starting;
        for attempt in 1..=MAX_CONSUME_ATTEMPTS {
            match self.try_attach_consumer().await {
                Ok((client, messages)) => {
                    info!(
                        group = %self.config.consumer_group,
                        topic = %self.config.outgoing_topic,
                        "bus consumer started"
                    );
                    consume.client = Some(client);
                    consume.state = ChannelState::Ready;
                    return Ok(BusStream { messages });
                }
                Err(err) => {
                    warn!(
                        attempt,
                        max = MAX_CONSUME_ATTEMPTS,
                        error = %err,
                        "bus consumer start failed"
                    );
                    if attempt < MAX_CONSUME_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }
        consume.state = ChannelState::Failed;
        Err(BusError::Exhausted {
            attempts: MAX_CONSUME_ATTEMPTS,
        })
    }

    async fn try_attach_consumer(
        &self,
    ) -> Result<(async_nats::Client, Messages), anyhow::Error> {
        let client = async_nats::connect(&self.config.servers).await?;
        let js = jetstream::new(client.clone());
        let stream = js
            .get_or_create_stream(StreamConfig {
                name: stream_name(&self.config.outgoing_topic),
                subjects: vec![self.config.outgoing_topic.clone()],
                ..Default::default()
            })
            .await?;
        let group = self.config.consumer_group.clone();
        let consumer = stream
            .get_or_create_consumer(
                &group,
                PushConfig {
                    durable_name: Some(group.clone()),
                    deliver_subject: format!("deliver.{group}"),
                    deliver_group: Some(group.clone()),
                    deliver_policy: DeliverPolicy::New,
                    ack_policy: jetstream::consumer::AckPolicy::None,
                    ..Default::default()
                },
            )
            .await?;
        let messages = consumer.messages().await?;
        Ok((client, messages))
    }

    /// Releases both connections, consume before publish. Idempotent and
    /// safe to call when never started.
    pub async fn stop(&self) {
        let mut consume = self.consume.lock().await;
        if let Some(client) = consume.client.take() {
            if let Err(err) = client.drain().await {
                warn!(error = %err, "error draining consume connection");
            }
        }
        consume.state = ChannelState::Uninitialized;
        drop(consume);

        let mut publish = self.publish.lock().await;
        if let Some(conn) = publish.conn.take() {
            if let Err(err) = conn.client.drain().await {
                warn!(error = %err, "error draining publish connection");
            }
        }
        publish.state = ChannelState::Uninitialized;
        info!("bus connections closed");
    }

    pub async fn publish_state(&self) -> ChannelState {
        self.publish.lock().await.state
    }

    pub async fn consume_state(&self) -> ChannelState {
        self.consume.lock().await.state
    }
}

#[async_trait]
impl BusPublisher for BusManager {
    /// One acknowledged request per call; no retry on failure, the caller
    /// decides whether to propagate or drop.
    async fn publish(&self, topic: &str, key: &str, value: &Value) -> Result<(), BusError> {
        let payload = encode_payload(value)?;
        let publish = self.publish.lock().await;
        let conn = publish.conn.as_ref().ok_or(BusError::NotStarted)?;
        let ack = if key.is_empty() {
            conn.jetstream
                .publish(topic.to_string(), payload.into())
                .await
        } else {
            let mut headers = async_nats::HeaderMap::new();
            headers.insert(MSG_KEY_HEADER, key);
            conn.jetstream
                .publish_with_headers(topic.to_string(), headers, payload.into())
                .await
        };
        ack.map_err(|err| BusError::Publish(anyhow::Error::new(err)))?
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))?;
        Ok(())
    }
}

/// Lazy, effectively infinite sequence of `(key, value)` pairs decoded with
/// the inverse of the publish encoding.
pub struct BusStream {
    messages: Messages,
}

impl BusStream {
    /// Next decoded message. Undecodable payloads and transient stream
    /// errors are logged and skipped; `None` means the subscription ended.
    pub async fn next(&mut self) -> Option<(String, Value)> {
        loop {
            let msg = match self.messages.next().await? {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "bus consume stream error");
                    continue;
                }
            };
            let key = msg
                .headers
                .as_ref()
                .and_then(|headers| headers.get(MSG_KEY_HEADER))
                .map(|value| value.as_str().to_string())
                .unwrap_or_default();
            match serde_json::from_slice::<Value>(&msg.payload) {
                Ok(value) => return Some((key, value)),
                Err(err) => warn!(error = %err, "skipping undecodable bus payload"),
            }
        }
    }
}

/// Test double recording every publish, in the spirit of the real manager.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    published: Arc<Mutex<Vec<(String, String, Value)>>>,
}

impl InMemoryBus {
    pub async fn take_published(&self) -> Vec<(String, String, Value)> {
        let mut guard = self.published.lock().await;
        std::mem::take(&mut *guard)
    }
}

#[async_trait]
impl BusPublisher for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, value: &Value) -> Result<(), BusError> {
        let mut guard = self.published.lock().await;
        guard.push((topic.to_string(), key.to_string(), value.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_starts_at_one_second() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let delays: Vec<Duration> = (1..=15).map(backoff_delay).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must be non-decreasing");
        }
        for delay in &delays {
            assert!(*delay <= Duration::from_secs(5));
        }
        assert_eq!(delays[14], Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_by_factor_before_cap() {
        assert_eq!(backoff_delay(2), Duration::from_secs_f64(1.5));
        assert_eq!(backoff_delay(3), Duration::from_secs_f64(2.25));
    }

    #[test]
    fn encode_is_compact() {
        let value = json!({"chat_id": 1, "text": "hi there"});
        let bytes = encode_payload(&value).unwrap();
        let encoded = String::from_utf8(bytes).unwrap();
        assert_eq!(encoded, r#"{"chat_id":1,"text":"hi there"}"#);
    }

    #[test]
    fn encode_preserves_non_ascii() {
        let value = json!({"text": "Привет"});
        let bytes = encode_payload(&value).unwrap();
        let encoded = String::from_utf8(bytes).unwrap();
        assert!(encoded.contains("Привет"), "non-ASCII must not be escaped");
    }

    #[test]
    fn stream_name_replaces_dots() {
        assert_eq!(stream_name("telegram.outgoing.messages"), "telegram-outgoing-messages");
    }

    #[tokio::test]
    async fn in_memory_bus_records_publishes() {
        let bus = InMemoryBus::default();
        bus.publish("user.events", "123", &json!({"type": "StartCommand"}))
            .await
            .unwrap();
        let published = bus.take_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "user.events");
        assert_eq!(published[0].1, "123");
        assert!(bus.take_published().await.is_empty());
    }

    #[tokio::test]
    async fn publish_before_start_is_rejected() {
        let bus = BusManager::new(BusConfig {
            servers: "nats://127.0.0.1:4222".into(),
            outgoing_topic: "telegram.outgoing.messages".into(),
            user_events_topic: "user.events".into(),
            consumer_group: "visor-bot".into(),
        });
        let err = bus.publish("user.events", "", &json!({})).await.unwrap_err();
        assert!(matches!(err, BusError::NotStarted));
        assert_eq!(bus.publish_state().await, ChannelState::Uninitialized);
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_never_started() {
        let bus = BusManager::new(BusConfig {
            servers: "nats://127.0.0.1:4222".into(),
            outgoing_topic: "telegram.outgoing.messages".into(),
            user_events_topic: "user.events".into(),
            consumer_group: "visor-bot".into(),
        });
        bus.stop().await;
        bus.stop().await;
        assert_eq!(bus.consume_state().await, ChannelState::Uninitialized);
    }
}

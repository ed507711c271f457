use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{SessionStore, session_key};

/// Redis-backed store; expiry is delegated to the server via `SET ... EX`.
pub struct RedisSessionStore {
    connection: Mutex<redis::aio::ConnectionManager>,
    ttl: Duration,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            connection: Mutex::new(manager),
            ttl,
        })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, chat_id: i64) -> Result<Map<String, Value>> {
        let mut conn = self.connection.lock().await;
        let payload: Option<String> = conn.get(session_key(chat_id)).await?;
        Ok(payload
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    async fn set(&self, chat_id: i64, data: Map<String, Value>) -> Result<()> {
        let payload = serde_json::to_string(&Value::Object(data))?;
        let mut conn = self.connection.lock().await;
        conn.set_ex::<_, _, ()>(session_key(chat_id), payload, self.ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn clear(&self, chat_id: i64) -> Result<()> {
        let mut conn = self.connection.lock().await;
        conn.del::<_, ()>(session_key(chat_id)).await?;
        Ok(())
    }
}

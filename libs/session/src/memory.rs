use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::SessionStore;

/// In-memory store with per-entry expiry, used for tests and local runs.
pub struct MemorySessionStore {
    entries: DashMap<i64, Entry>,
    ttl: Duration,
}

struct Entry {
    payload: String,
    expires_at: Instant,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, chat_id: i64) -> Result<Map<String, Value>> {
        if let Some(entry) = self.entries.get(&chat_id) {
            if entry.expires_at > Instant::now() {
                return Ok(serde_json::from_str(&entry.payload).unwrap_or_default());
            }
        }
        self.entries
            .remove_if(&chat_id, |_, entry| entry.expires_at <= Instant::now());
        Ok(Map::new())
    }

    async fn set(&self, chat_id: i64, data: Map<String, Value>) -> Result<()> {
        let payload = serde_json::to_string(&Value::Object(data))?;
        self.entries.insert(
            chat_id,
            Entry {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn clear(&self, chat_id: i64) -> Result<()> {
        self.entries.remove(&chat_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Map<String, Value> {
        json!({"state": "started", "имя": "Анна"})
            .as_object()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn set_get_clear_roundtrip() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        assert!(store.get(1).await.unwrap().is_empty());
        store.set(1, data()).await.unwrap();
        let loaded = store.get(1).await.unwrap();
        assert_eq!(loaded.get("state"), Some(&json!("started")));
        assert_eq!(loaded.get("имя"), Some(&json!("Анна")));
        store.clear(1).await.unwrap();
        assert!(store.get(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = MemorySessionStore::new(Duration::from_millis(10));
        store.set(7, data()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.get(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_chat() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.set(1, data()).await.unwrap();
        assert!(store.get(2).await.unwrap().is_empty());
    }
}

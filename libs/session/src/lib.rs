//! TTL-scoped key/value session state keyed by chat id.
//!
//! Values are JSON object snapshots serialized with non-ASCII preserved.
//! Entries expire after the configured TTL; an expired or malformed entry
//! reads back as an empty map.

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use std::{env, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
#[cfg(not(feature = "redis-store"))]
use tracing::warn;

pub use memory::MemorySessionStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisSessionStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(1800);

/// Shared session store handle.
pub type SharedSessionStore = Arc<dyn SessionStore>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the stored session data, or an empty map when absent,
    /// expired, or unreadable.
    async fn get(&self, chat_id: i64) -> Result<Map<String, Value>>;
    async fn set(&self, chat_id: i64, data: Map<String, Value>) -> Result<()>;
    async fn clear(&self, chat_id: i64) -> Result<()>;
}

#[cfg(feature = "redis-store")]
fn session_key(chat_id: i64) -> String {
    format!("session:{chat_id}")
}

/// Builds a session store from the environment: `SESSION_REDIS_URL` selects
/// the redis backend when the `redis-store` feature is enabled, otherwise
/// the in-memory store is used.
pub async fn store_from_env(ttl: Duration) -> Result<SharedSessionStore> {
    match env::var("SESSION_REDIS_URL") {
        Ok(url) => build_redis_store(&url, ttl).await,
        Err(_) => Ok(Arc::new(MemorySessionStore::new(ttl))),
    }
}

#[cfg(feature = "redis-store")]
async fn build_redis_store(url: &str, ttl: Duration) -> Result<SharedSessionStore> {
    let store = RedisSessionStore::connect(url, ttl).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn build_redis_store(_url: &str, ttl: Duration) -> Result<SharedSessionStore> {
    warn!("redis-store feature disabled; using in-memory session store");
    Ok(Arc::new(MemorySessionStore::new(ttl)))
}

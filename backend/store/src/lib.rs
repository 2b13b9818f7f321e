//! Backing stores for the Keystone trust backend.

pub mod memory;
pub mod redis_store;

use std::sync::Arc;

use keystone_core::{BackingStore, StoreError, StoreResult};

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisTarget};

/// Open the store named by `url`: `redis://...` or `memory://`.
pub async fn open_store(url: &str) -> StoreResult<Arc<dyn BackingStore>> {
    match url.split_once("://").map(|(scheme, _)| scheme) {
        Some("redis") => Ok(Arc::new(RedisStore::connect(url).await?)),
        Some("memory") => {
            tracing::warn!("Using the in-memory store; nothing will survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        _ => Err(StoreError::new("connect", url, "unsupported store URL")),
    }
}

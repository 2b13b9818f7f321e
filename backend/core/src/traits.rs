use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by a backing store implementation.
#[derive(Debug, Clone, Error)]
#[error("{op} on {target} failed: {message}")]
pub struct StoreError {
    pub op: &'static str,
    pub target: String,
    pub message: String,
}

impl StoreError {
    pub fn new(op: &'static str, target: impl Into<String>, message: impl ToString) -> Self {
        Self {
            op,
            target: target.into(),
            message: message.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Position inside an append-only stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamCursor {
    /// Before the first entry.
    #[default]
    Start,
    /// Strictly after the entry with this id.
    After(String),
}

/// One entry read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamRecord {
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }
}

/// Keyed-hash plus append-only stream store that backs the trust engine.
///
/// Implementations must give read-after-write consistency per key; nothing
/// here promises atomicity across keys.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Short implementation name (e.g. "redis").
    fn name(&self) -> &str;

    /// Address of the underlying database, for display.
    fn database(&self) -> String;

    async fn hash_get(&self, hash: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>>;

    async fn hash_set(&self, hash: &str, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Remove one field; returns the number of fields removed (0 or 1).
    async fn hash_delete(&self, hash: &str, key: &str) -> StoreResult<u64>;

    /// Remove a whole top-level key (hash or stream); returns 0 or 1.
    async fn key_delete(&self, key: &str) -> StoreResult<u64>;

    /// Append an entry, trimming the stream to roughly `approx_cap` entries.
    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &[u8])],
        approx_cap: usize,
    ) -> StoreResult<String>;

    /// Read up to `count` entries following `cursor`, oldest first.
    async fn stream_read(
        &self,
        stream: &str,
        cursor: &StreamCursor,
        count: usize,
    ) -> StoreResult<Vec<StreamRecord>>;
}

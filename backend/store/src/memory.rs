//! In-process backing store.
//!
//! Same semantics as the Redis store (hashes vanish when their last field is
//! removed, stream ids are `<millis>-<seq>`), plus failure injection and call
//! counting so tests can exercise partial-failure paths.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use keystone_core::{BackingStore, StoreError, StoreResult, StreamCursor, StreamRecord};
use tokio::sync::Mutex;
use tracing::debug;

type StreamId = (u64, u64);

#[derive(Default)]
struct MemStream {
    entries: VecDeque<(StreamId, HashMap<String, Vec<u8>>)>,
    last_id: StreamId,
}

/// An injected failure: every matching call errors until cleared, or for
/// `remaining` calls if set.
#[derive(Debug, Clone)]
struct FailPoint {
    op: &'static str,
    target_prefix: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    streams: HashMap<String, MemStream>,
    failures: Vec<FailPoint>,
    calls: HashMap<&'static str, usize>,
}

impl Inner {
    fn enter(&mut self, op: &'static str, target: &str) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;
        let hit = self
            .failures
            .iter_mut()
            .find(|f| f.op == op && target.starts_with(&f.target_prefix));
        if let Some(point) = hit {
            if let Some(n) = point.remaining.as_mut() {
                *n -= 1;
            }
            self.failures.retain(|f| f.remaining != Some(0));
            return Err(StoreError::new(op, target, "injected failure"));
        }
        Ok(())
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make every `op` call whose hash/stream name starts with `target_prefix` fail.
    pub async fn fail_on(&self, op: &'static str, target_prefix: impl Into<String>) {
        self.inner.lock().await.failures.push(FailPoint {
            op,
            target_prefix: target_prefix.into(),
            remaining: None,
        });
    }

    /// Like [`fail_on`](Self::fail_on) but only for the next `times` matching calls.
    pub async fn fail_times(&self, op: &'static str, target_prefix: impl Into<String>, times: usize) {
        if times == 0 {
            return;
        }
        self.inner.lock().await.failures.push(FailPoint {
            op,
            target_prefix: target_prefix.into(),
            remaining: Some(times),
        });
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    /// Number of calls made to `op` so far, failed ones included.
    pub async fn calls(&self, op: &str) -> usize {
        self.inner.lock().await.calls.get(op).copied().unwrap_or(0)
    }

    pub async fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .await
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub async fn key_exists(&self, key: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.hashes.contains_key(key) || inner.streams.contains_key(key)
    }
}

fn parse_id(stream: &str, id: &str) -> StoreResult<StreamId> {
    let (ms, seq) = id
        .split_once('-')
        .ok_or_else(|| StoreError::new("stream_read", stream, format!("malformed id {id}")))?;
    let ms = ms
        .parse()
        .map_err(|_| StoreError::new("stream_read", stream, format!("malformed id {id}")))?;
    let seq = seq
        .parse()
        .map_err(|_| StoreError::new("stream_read", stream, format!("malformed id {id}")))?;
    Ok((ms, seq))
}

fn format_id((ms, seq): StreamId) -> String {
    format!("{ms}-{seq}")
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn database(&self) -> String {
        "memory://".to_string()
    }

    async fn hash_get(&self, hash: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        inner.enter("hash_get", hash)?;
        Ok(inner.hashes.get(hash).and_then(|h| h.get(key)).cloned())
    }

    async fn hash_get_all(&self, hash: &str) -> StoreResult<HashMap<String, Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        inner.enter("hash_get_all", hash)?;
        Ok(inner.hashes.get(hash).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, hash: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter("hash_set", hash)?;
        inner
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn hash_delete(&self, hash: &str, key: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.enter("hash_delete", hash)?;
        let Some(fields) = inner.hashes.get_mut(hash) else {
            return Ok(0);
        };
        let removed = fields.remove(key).is_some();
        if fields.is_empty() {
            inner.hashes.remove(hash);
        }
        Ok(removed as u64)
    }

    async fn key_delete(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.enter("key_delete", key)?;
        let removed = inner.hashes.remove(key).is_some() | inner.streams.remove(key).is_some();
        Ok(removed as u64)
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &[u8])],
        approx_cap: usize,
    ) -> StoreResult<String> {
        let mut inner = self.inner.lock().await;
        inner.enter("stream_append", stream)?;
        let s = inner.streams.entry(stream.to_string()).or_default();

        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = if now > s.last_id.0 {
            (now, 0)
        } else {
            (s.last_id.0, s.last_id.1 + 1)
        };
        s.last_id = id;
        s.entries.push_back((
            id,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        ));

        // Trim lazily once the stream overshoots by a tenth, like MAXLEN ~.
        if approx_cap > 0 && s.entries.len() > approx_cap + approx_cap / 10 {
            let excess = s.entries.len() - approx_cap;
            s.entries.drain(..excess);
            debug!(stream, trimmed = excess, "Trimmed in-memory stream");
        }
        Ok(format_id(id))
    }

    async fn stream_read(
        &self,
        stream: &str,
        cursor: &StreamCursor,
        count: usize,
    ) -> StoreResult<Vec<StreamRecord>> {
        let mut inner = self.inner.lock().await;
        inner.enter("stream_read", stream)?;
        let after = match cursor {
            StreamCursor::Start => None,
            StreamCursor::After(id) => Some(parse_id(stream, id)?),
        };
        let Some(s) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(s.entries
            .iter()
            .filter(|(id, _)| after.map_or(true, |a| *id > a))
            .take(count)
            .map(|(id, fields)| StreamRecord {
                id: format_id(*id),
                fields: fields.clone(),
            })
            .collect())
    }
}

//! Telemetry streams: capped per-device append logs of JSON payloads, read
//! back as newline-delimited JSON.

use std::collections::VecDeque;
use std::sync::Arc;

use keystone_core::{
    BackingStore, LogBundle, MetricsSnapshot, StatusReport, StreamCursor, StreamRecord,
    TelemetryKind, TelemetryMessage, TrustError, TrustResult,
};
use tracing::debug;
use uuid::Uuid;

use crate::keys::{stream_entry, STREAM_ENTRY_VERSION, STREAM_OBJECT_FIELD, STREAM_VERSION_FIELD};
use crate::manager::TrustManager;

impl TrustManager {
    /// Append `msg` to the stream of the device it names.
    ///
    /// The device does not have to be registered.
    pub async fn write_telemetry<M: TelemetryMessage>(&self, msg: &M) -> TrustResult<()> {
        let uuid = Uuid::parse_str(msg.device_id()).map_err(|e| {
            TrustError::InvalidInput(format!("{} message device id {:?}: {e}", M::KIND, msg.device_id()))
        })?;
        let payload = serde_json::to_vec(msg)
            .map_err(|e| TrustError::InvalidInput(format!("unserializable {} message: {e}", M::KIND)))?;
        let stream = M::KIND.stream_for(uuid);
        let id = self
            .store
            .stream_append(&stream, &stream_entry(&payload), self.settings.stream_cap(M::KIND))
            .await
            .map_err(|e| TrustError::store(format!("xadd {stream}"), e))?;
        debug!(device = %uuid, kind = %M::KIND, entry = %id, "Appended telemetry");
        Ok(())
    }

    pub async fn write_info(&self, msg: &StatusReport) -> TrustResult<()> {
        self.write_telemetry(msg).await
    }

    pub async fn write_logs(&self, msg: &LogBundle) -> TrustResult<()> {
        self.write_telemetry(msg).await
    }

    pub async fn write_metrics(&self, msg: &MetricsSnapshot) -> TrustResult<()> {
        self.write_telemetry(msg).await
    }

    /// Reader over one device stream, starting at its oldest retained entry.
    pub fn reader(&self, kind: TelemetryKind, uuid: Uuid) -> StreamReader {
        StreamReader::new(
            self.store.clone(),
            kind.stream_for(uuid),
            self.settings.read_batch,
        )
    }
}

/// Pages through a stream and yields one JSON line per entry.
///
/// Seed entries with an empty payload are skipped. A stream that does not
/// exist reads as empty.
pub struct StreamReader {
    store: Arc<dyn BackingStore>,
    stream: String,
    cursor: StreamCursor,
    batch: usize,
    pending: VecDeque<StreamRecord>,
    exhausted: bool,
}

impl StreamReader {
    pub fn new(store: Arc<dyn BackingStore>, stream: String, batch: usize) -> Self {
        Self {
            store,
            stream,
            cursor: StreamCursor::Start,
            batch: batch.max(1),
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Next payload followed by `\n`, or `None` at the end of the stream.
    ///
    /// Entries appended after the end was reached are picked up by the next call.
    pub async fn next_line(&mut self) -> TrustResult<Option<String>> {
        loop {
            let Some(record) = self.next_record().await? else {
                return Ok(None);
            };
            let version = record.field(STREAM_VERSION_FIELD).unwrap_or_default();
            if version != STREAM_ENTRY_VERSION.as_bytes() {
                return Err(TrustError::Decode(format!(
                    "{} entry {}: unsupported version {:?}",
                    self.stream,
                    record.id,
                    String::from_utf8_lossy(version)
                )));
            }
            let object = record.field(STREAM_OBJECT_FIELD).unwrap_or_default();
            if object.is_empty() {
                continue;
            }
            let mut line = String::from_utf8(object.to_vec()).map_err(|e| {
                TrustError::decode(format!("{} entry {}", self.stream, record.id), e)
            })?;
            line.push('\n');
            return Ok(Some(line));
        }
    }

    async fn next_record(&mut self) -> TrustResult<Option<StreamRecord>> {
        if self.pending.is_empty() {
            self.fill().await?;
        }
        let Some(record) = self.pending.pop_front() else {
            return Ok(None);
        };
        self.cursor = StreamCursor::After(record.id.clone());
        Ok(Some(record))
    }

    async fn fill(&mut self) -> TrustResult<()> {
        let page = self
            .store
            .stream_read(&self.stream, &self.cursor, self.batch)
            .await
            .map_err(|e| TrustError::store(format!("xrange {}", self.stream), e))?;
        self.exhausted = page.len() < self.batch;
        self.pending.extend(page);
        Ok(())
    }

    /// Every remaining line, concatenated.
    pub async fn read_to_end(&mut self) -> TrustResult<String> {
        let mut out = String::new();
        while let Some(line) = self.next_line().await? {
            out.push_str(&line);
        }
        Ok(out)
    }

    /// Whether the last page fetched was short, i.e. the reader caught up.
    pub fn caught_up(&self) -> bool {
        self.exhausted && self.pending.is_empty()
    }

    /// Start again from the oldest retained entry.
    pub fn rewind(&mut self) {
        self.cursor = StreamCursor::Start;
        self.pending.clear();
        self.exhausted = false;
    }
}

//! Pending-operation markers for multi-key writes and deletes.
//!
//! Before touching a device's (or onboarding certificate's) records, a marker
//! listing every key involved is written to `PENDING_OPS`. The marker is
//! removed once the operation fully succeeds. A marker left behind by a crash
//! or a store failure is resolved by [`Coordinator::recover`]: registrations are
//! rolled back, removals are driven to completion. Both amount to dropping the
//! listed keys, which is idempotent.
//!
//! While a marker exists its subject is hidden from the trust cache, so readers
//! see a device either fully present or fully absent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keystone_core::{BackingStore, StoreError, TrustError, TrustResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::keys::{StoreKey, PENDING_OPS_HASH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    RegisterDevice,
    RemoveDevice,
    ClearDevices,
    RemoveOnboard,
    ClearOnboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    RollBack,
    RollForward,
}

impl PendingKind {
    pub fn resolution(self) -> Resolution {
        match self {
            PendingKind::RegisterDevice => Resolution::RollBack,
            _ => Resolution::RollForward,
        }
    }
}

/// What a marker protects; hidden from the cache while the marker exists.
///
/// Subjects always name concrete records, never a whole hash, so resolving a
/// marker cannot touch records created after it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Device(Uuid),
    Devices(Vec<Uuid>),
    /// Onboarding certificate by Common Name.
    Onboard(String),
    Onboards(Vec<String>),
}

impl Subject {
    pub fn covers_onboard(&self, cn: &str) -> bool {
        match self {
            Subject::Onboard(c) => c == cn,
            Subject::Onboards(cns) => cns.iter().any(|c| c == cn),
            Subject::Device(_) | Subject::Devices(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOp {
    pub id: Uuid,
    pub kind: PendingKind,
    pub subject: Subject,
    pub keys: Vec<StoreKey>,
    pub started_at: DateTime<Utc>,
}

/// Subjects currently covered by markers.
#[derive(Debug, Default, Clone)]
pub struct HiddenSubjects {
    pub devices: HashSet<Uuid>,
    pub onboard_cns: HashSet<String>,
}

impl HiddenSubjects {
    pub fn from_ops(ops: &[PendingOp]) -> Self {
        let mut hidden = Self::default();
        for op in ops {
            match &op.subject {
                Subject::Device(u) => {
                    hidden.devices.insert(*u);
                }
                Subject::Devices(us) => hidden.devices.extend(us.iter().copied()),
                Subject::Onboard(cn) => {
                    hidden.onboard_cns.insert(cn.clone());
                }
                Subject::Onboards(cns) => hidden.onboard_cns.extend(cns.iter().cloned()),
            }
        }
        hidden
    }

    /// Union with the subjects of another marker scan.
    pub fn merge(&mut self, other: HiddenSubjects) {
        self.devices.extend(other.devices);
        self.onboard_cns.extend(other.onboard_cns);
    }

    pub fn hides_onboard(&self, cn: &str) -> bool {
        self.onboard_cns.contains(cn)
    }
}

/// Outcome of dropping a set of keys.
#[derive(Debug, Default)]
pub struct DropReport {
    pub deleted: usize,
    pub missing: Vec<StoreKey>,
    pub failed: Vec<(StoreKey, StoreError)>,
}

impl DropReport {
    /// No store call failed; missing keys are fine.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_error(self, context: impl Into<String>) -> TrustError {
        let failed_keys = self.failed.len() + if self.deleted == 0 { self.missing.len() } else { 0 };
        let mut parts: Vec<String> = self
            .failed
            .iter()
            .map(|(k, e)| format!("couldn't drop {k}: {e}"))
            .collect();
        if self.deleted == 0 && !self.missing.is_empty() {
            parts.push(format!("no matching keys among {}", self.missing.len()));
        }
        TrustError::BackingStore {
            context: context.into(),
            failed_keys,
            message: parts.join("; "),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rolled_back: usize,
    pub completed: usize,
    /// Markers too young to touch.
    pub deferred: usize,
    /// Markers that could not be decoded and were removed.
    pub discarded: usize,
    /// Markers whose keys could not all be dropped; retried next sweep.
    pub unresolved: usize,
}

impl RecoveryReport {
    pub fn touched(&self) -> bool {
        self.rolled_back + self.completed + self.discarded > 0
    }
}

pub struct Coordinator {
    store: Arc<dyn BackingStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Persist a marker describing the keys about to be mutated.
    pub async fn begin(
        &self,
        kind: PendingKind,
        subject: Subject,
        keys: Vec<StoreKey>,
    ) -> TrustResult<PendingOp> {
        let op = PendingOp {
            id: Uuid::new_v4(),
            kind,
            subject,
            keys,
            started_at: Utc::now(),
        };
        let encoded = serde_json::to_vec(&op)
            .map_err(|e| TrustError::decode("pending operation marker", e))?;
        let field = op.id.to_string();
        self.store
            .hash_set(PENDING_OPS_HASH, &field, &encoded)
            .await
            .map_err(|e| TrustError::store(format!("hset {PENDING_OPS_HASH}[{field}]"), e))?;
        debug!(op = %op.id, kind = ?op.kind, keys = op.keys.len(), "Pending operation started");
        Ok(op)
    }

    /// Remove the marker of a fully applied operation.
    pub async fn finish(&self, op: &PendingOp) -> TrustResult<()> {
        let field = op.id.to_string();
        self.store
            .hash_delete(PENDING_OPS_HASH, &field)
            .await
            .map_err(|e| TrustError::store(format!("hdel {PENDING_OPS_HASH}[{field}]"), e))?;
        debug!(op = %op.id, "Pending operation finished");
        Ok(())
    }

    /// Drop every key, continuing past failures.
    pub async fn drop_keys(&self, keys: &[StoreKey]) -> DropReport {
        let mut report = DropReport::default();
        for key in keys {
            let result = match key {
                StoreKey::Field { hash, key: field } => self.store.hash_delete(hash, field).await,
                StoreKey::Key { name } => self.store.key_delete(name).await,
            };
            match result {
                Ok(0) => report.missing.push(key.clone()),
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to drop key");
                    report.failed.push((key.clone(), e));
                }
            }
        }
        report
    }

    /// Undo a partially applied operation in-process. Returns whether the
    /// marker could be cleared; if not, the next sweep picks it up.
    pub async fn roll_back(&self, op: &PendingOp) -> bool {
        let report = self.drop_keys(&op.keys).await;
        if !report.is_clean() {
            warn!(op = %op.id, failed = report.failed.len(), "Rollback incomplete; leaving marker for recovery");
            return false;
        }
        match self.finish(op).await {
            Ok(()) => {
                info!(op = %op.id, dropped = report.deleted, "Rolled back partial operation");
                true
            }
            Err(e) => {
                warn!(op = %op.id, error = %e, "Rolled back but could not clear marker");
                false
            }
        }
    }

    /// All markers currently stored. Undecodable markers are an error.
    pub async fn pending(&self) -> TrustResult<Vec<PendingOp>> {
        let raw = self
            .store
            .hash_get_all(PENDING_OPS_HASH)
            .await
            .map_err(|e| TrustError::store(format!("hgetall {PENDING_OPS_HASH}"), e))?;
        raw.into_iter()
            .map(|(field, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| TrustError::decode(format!("pending operation {field}"), e))
            })
            .collect()
    }

    /// Complete any pending removal of onboarding certificate `cn` now,
    /// regardless of its age, so a new record under that name is not hidden
    /// or later dropped by it. Returns how many markers were settled.
    pub async fn settle_onboard(&self, cn: &str) -> TrustResult<usize> {
        let mut settled = 0;
        for op in self.pending().await? {
            if !op.subject.covers_onboard(cn) {
                continue;
            }
            let report = self.drop_keys(&op.keys).await;
            if !report.is_clean() {
                return Err(report.into_error(format!("complete pending removal covering {cn}")));
            }
            self.finish(&op).await?;
            info!(op = %op.id, kind = ?op.kind, cn = %cn, "Settled pending removal before re-registration");
            settled += 1;
        }
        Ok(settled)
    }

    /// Resolve every marker older than `grace`.
    pub async fn recover(&self, grace: Duration) -> TrustResult<RecoveryReport> {
        let raw = self
            .store
            .hash_get_all(PENDING_OPS_HASH)
            .await
            .map_err(|e| TrustError::store(format!("hgetall {PENDING_OPS_HASH}"), e))?;
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for (field, bytes) in raw {
            let op: PendingOp = match serde_json::from_slice(&bytes) {
                Ok(op) => op,
                Err(e) => {
                    warn!(marker = %field, error = %e, "Discarding undecodable pending marker");
                    self.store
                        .hash_delete(PENDING_OPS_HASH, &field)
                        .await
                        .map_err(|e| TrustError::store(format!("hdel {PENDING_OPS_HASH}[{field}]"), e))?;
                    report.discarded += 1;
                    continue;
                }
            };

            let age = now.signed_duration_since(op.started_at).to_std().unwrap_or_default();
            if age < grace {
                report.deferred += 1;
                continue;
            }

            let dropped = self.drop_keys(&op.keys).await;
            if !dropped.is_clean() {
                report.unresolved += 1;
                continue;
            }
            self.finish(&op).await?;
            match op.kind.resolution() {
                Resolution::RollBack => report.rolled_back += 1,
                Resolution::RollForward => report.completed += 1,
            }
            info!(op = %op.id, kind = ?op.kind, dropped = dropped.deleted, "Resolved pending operation");
        }
        Ok(report)
    }
}

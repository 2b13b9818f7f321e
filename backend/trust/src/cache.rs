//! Trust cache: a disposable, TTL-bounded projection of the backing store.
//!
//! Snapshots are immutable. A refresh builds a complete new snapshot off to the
//! side and publishes it with a single pointer swap, so readers always see
//! either the old or the new state. Scans and write-through updates are
//! serialized by the refresh gate. Once a snapshot has been published, a
//! reader that finds a scan in flight serves the current snapshot instead of
//! queueing behind it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keystone_core::{BackingStore, CertIdentity, Certificate, TrustError, TrustResult, WILDCARD_SERIAL};
use keystone_logging::redact_sensitive_data;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::{HiddenSubjects, PendingOp};
use crate::keys::{
    DEVICE_CERTS_HASH, DEVICE_ONBOARD_CERTS_HASH, DEVICE_SERIALS_HASH, ONBOARD_CERTS_HASH,
    ONBOARD_SERIALS_HASH, PENDING_OPS_HASH,
};

/// Cached view of one onboarding certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnboardEntry {
    pub common_name: String,
    pub serials: HashSet<String>,
}

impl OnboardEntry {
    pub fn new(common_name: impl Into<String>, serials: impl IntoIterator<Item = String>) -> Self {
        Self {
            common_name: common_name.into(),
            serials: serials.into_iter().collect(),
        }
    }

    /// The serial is listed, or the set carries the wildcard.
    pub fn accepts(&self, serial: &str) -> bool {
        self.serials.contains(serial) || self.serials.contains(WILDCARD_SERIAL)
    }
}

/// Cached onboarding binding of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBinding {
    pub onboard: Option<CertIdentity>,
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TrustSnapshot {
    pub onboard_certs: HashMap<CertIdentity, OnboardEntry>,
    pub device_certs: HashMap<CertIdentity, Uuid>,
    pub devices: HashMap<Uuid, DeviceBinding>,
    /// (onboarding cert, concrete serial) -> device that used it.
    serial_index: HashMap<(CertIdentity, String), Uuid>,
}

impl TrustSnapshot {
    pub fn device_for_serial(&self, onboard: &CertIdentity, serial: &str) -> Option<Uuid> {
        self.serial_index
            .get(&(onboard.clone(), serial.to_string()))
            .copied()
    }

    pub fn insert_device(&mut self, uuid: Uuid, cert: CertIdentity, binding: DeviceBinding) {
        self.device_certs.insert(cert, uuid);
        self.index_binding(uuid, &binding);
        self.devices.insert(uuid, binding);
    }

    pub fn insert_onboard(&mut self, cert: CertIdentity, entry: OnboardEntry) {
        // one certificate per Common Name
        self.onboard_certs
            .retain(|_, existing| existing.common_name != entry.common_name);
        self.onboard_certs.insert(cert, entry);
    }

    pub fn remove_devices(&mut self, uuids: &[Uuid]) {
        self.device_certs.retain(|_, u| !uuids.contains(u));
        for u in uuids {
            self.devices.remove(u);
        }
        self.rebuild_index();
    }

    fn index_binding(&mut self, uuid: Uuid, binding: &DeviceBinding) {
        if let (Some(onboard), Some(serial)) = (&binding.onboard, &binding.serial) {
            self.serial_index.insert((onboard.clone(), serial.clone()), uuid);
        }
    }

    fn rebuild_index(&mut self) {
        self.serial_index.clear();
        let bindings: Vec<(Uuid, DeviceBinding)> =
            self.devices.iter().map(|(u, b)| (*u, b.clone())).collect();
        for (uuid, binding) in bindings {
            self.index_binding(uuid, &binding);
        }
    }
}

pub struct TrustCache {
    snapshot: RwLock<Arc<TrustSnapshot>>,
    /// Time of the last successful refresh; `None` forces the next one.
    refreshed_at: RwLock<Option<Instant>>,
    /// Held for a store scan or a write-through update.
    gate: Mutex<()>,
    timeout_secs: AtomicU64,
}

impl TrustCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(TrustSnapshot::default())),
            refreshed_at: RwLock::new(None),
            gate: Mutex::new(()),
            timeout_secs: AtomicU64::new(timeout.as_secs()),
        }
    }

    async fn is_fresh(&self) -> bool {
        let timeout = self.timeout();
        match *self.refreshed_at.read().await {
            Some(at) => !timeout.is_zero() && at.elapsed() < timeout,
            None => false,
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_secs.store(timeout.as_secs(), Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.load(Ordering::Relaxed))
    }

    /// Current snapshot; the read lock is held only for the pointer clone.
    pub async fn snapshot(&self) -> Arc<TrustSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Reload from the store unless the last refresh is younger than the TTL.
    /// Returns whether a scan happened. On failure the previous snapshot stays
    /// in place and the timestamp is left alone, so the next call retries.
    ///
    /// If another scan is already running and a snapshot has been published
    /// since the last invalidation, that snapshot is served as is.
    pub async fn refresh(&self, store: &dyn BackingStore) -> TrustResult<bool> {
        if self.is_fresh().await {
            return Ok(false);
        }
        let _gate = match self.gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                if self.refreshed_at.read().await.is_some() {
                    return Ok(false);
                }
                self.gate.lock().await
            }
        };
        if self.is_fresh().await {
            return Ok(false);
        }

        let started = Instant::now();
        let fresh = load_snapshot(store).await?;
        debug!(
            onboard = fresh.onboard_certs.len(),
            devices = fresh.devices.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Trust cache refreshed"
        );
        *self.snapshot.write().await = Arc::new(fresh);
        *self.refreshed_at.write().await = Some(started);
        Ok(true)
    }

    /// Force the next [`refresh`](Self::refresh) to hit the store. Waits for
    /// an in-flight scan so its result cannot mark the cache fresh again.
    pub async fn invalidate(&self) {
        let _gate = self.gate.lock().await;
        *self.refreshed_at.write().await = None;
    }

    /// Write-through mutation of the published snapshot, after a successful
    /// store write. Waits for any in-flight refresh so it is not overwritten.
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut TrustSnapshot),
    {
        let _gate = self.gate.lock().await;
        let mut published = self.snapshot.write().await;
        let mut next = TrustSnapshot::clone(&published);
        mutate(&mut next);
        *published = Arc::new(next);
    }
}

fn parse_uuid(hash: &str, key: &str) -> TrustResult<Uuid> {
    Uuid::parse_str(key).map_err(|e| TrustError::decode(format!("device UUID {key} in {hash}"), e))
}

fn decode_cert(hash: &str, key: &str, bytes: &[u8]) -> TrustResult<Certificate> {
    Certificate::from_pem(bytes).map_err(|e| {
        let shown = redact_sensitive_data(&String::from_utf8_lossy(bytes));
        TrustError::Decode(format!("certificate {hash}[{key}]: {e} ({shown})"))
    })
}

async fn scan_markers(store: &dyn BackingStore) -> TrustResult<HiddenSubjects> {
    let markers = store
        .hash_get_all(PENDING_OPS_HASH)
        .await
        .map_err(|e| TrustError::store(format!("hgetall {PENDING_OPS_HASH}"), e))?;
    let ops = markers
        .iter()
        .map(|(field, bytes)| {
            serde_json::from_slice::<PendingOp>(bytes)
                .map_err(|e| TrustError::decode(format!("pending operation {field}"), e))
        })
        .collect::<TrustResult<Vec<_>>>()?;
    if !ops.is_empty() {
        debug!(pending = ops.len(), "Hiding subjects of pending operations");
    }
    Ok(HiddenSubjects::from_ops(&ops))
}

/// Build a complete snapshot from the store.
///
/// Order: markers, onboarding certs with their serials, device certs, device
/// onboarding bindings, device serials, markers again. Subjects of markers seen
/// by either marker scan are left out, as are bindings and serials that have no
/// device certificate.
pub async fn load_snapshot(store: &dyn BackingStore) -> TrustResult<TrustSnapshot> {
    let mut hidden = scan_markers(store).await?;

    let mut snap = TrustSnapshot::default();

    let onboard = store
        .hash_get_all(ONBOARD_CERTS_HASH)
        .await
        .map_err(|e| TrustError::store(format!("hgetall {ONBOARD_CERTS_HASH}"), e))?;
    for (cn, pem) in &onboard {
        if hidden.hides_onboard(cn) {
            continue;
        }
        let cert = decode_cert(ONBOARD_CERTS_HASH, cn, pem)?;
        let serials = match store
            .hash_get(ONBOARD_SERIALS_HASH, cn)
            .await
            .map_err(|e| TrustError::store(format!("hget {ONBOARD_SERIALS_HASH}[{cn}]"), e))?
        {
            Some(bytes) => rmp_serde::from_slice::<Vec<String>>(&bytes)
                .map_err(|e| TrustError::decode(format!("onboard serials for {cn}"), e))?,
            None => {
                warn!(cn = %cn, "Onboarding certificate has no serial list; accepting none");
                Vec::new()
            }
        };
        snap.onboard_certs
            .insert(cert.identity(), OnboardEntry::new(cn.clone(), serials));
    }

    let device_certs = store
        .hash_get_all(DEVICE_CERTS_HASH)
        .await
        .map_err(|e| TrustError::store(format!("hgetall {DEVICE_CERTS_HASH}"), e))?;
    for (key, pem) in &device_certs {
        let uuid = parse_uuid(DEVICE_CERTS_HASH, key)?;
        if hidden.devices.contains(&uuid) {
            continue;
        }
        let cert = decode_cert(DEVICE_CERTS_HASH, key, pem)?;
        snap.device_certs.insert(cert.identity(), uuid);
        snap.devices.insert(uuid, DeviceBinding::default());
    }

    let bindings = store
        .hash_get_all(DEVICE_ONBOARD_CERTS_HASH)
        .await
        .map_err(|e| TrustError::store(format!("hgetall {DEVICE_ONBOARD_CERTS_HASH}"), e))?;
    for (key, pem) in &bindings {
        let uuid = parse_uuid(DEVICE_ONBOARD_CERTS_HASH, key)?;
        let Some(device) = snap.devices.get_mut(&uuid) else {
            debug!(device = %uuid, "Ignoring onboarding binding without device certificate");
            continue;
        };
        device.onboard = Some(decode_cert(DEVICE_ONBOARD_CERTS_HASH, key, pem)?.identity());
    }

    // serials are best effort: an unreadable hash leaves bindings without one
    match store.hash_get_all(DEVICE_SERIALS_HASH).await {
        Ok(serials) => {
            for (key, serial) in serials {
                let Ok(uuid) = Uuid::parse_str(&key) else {
                    warn!(key = %key, "Skipping device serial with malformed UUID");
                    continue;
                };
                if let Some(device) = snap.devices.get_mut(&uuid) {
                    device.serial = Some(String::from_utf8_lossy(&serial).into_owned());
                }
            }
        }
        Err(e) => warn!(error = %e, "Could not load device serials; continuing without them"),
    }

    // operations that began while the records were being read
    hidden.merge(scan_markers(store).await?);
    snap.devices.retain(|u, _| !hidden.devices.contains(u));
    snap.device_certs.retain(|_, u| !hidden.devices.contains(u));
    snap.onboard_certs
        .retain(|_, e| !hidden.hides_onboard(&e.common_name));

    snap.rebuild_index();
    Ok(snap)
}

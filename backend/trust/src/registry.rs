//! Device lifecycle: registration, lookup, enumeration and removal.
//!
//! Registration walks cert-validated -> uuid-minted -> onboard-persisted ->
//! serial-persisted -> config-seeded -> streams-seeded -> cert-persisted ->
//! cached. A pending marker covers every step; any failure before `cached`
//! rolls the written records back. The device certificate goes in last and
//! comes out first, so a refresh never finds it without the rest.

use std::collections::BTreeSet;

use keystone_core::{
    Certificate, DeviceConfig, DeviceDetails, TelemetryKind, TrustError, TrustResult,
};
use keystone_logging::{AuditEvent, AuditLog};
use tracing::warn;
use uuid::Uuid;

use crate::authorizer::ensure_concrete_serial;
use crate::cache::DeviceBinding;
use crate::coordinator::{PendingKind, Subject};
use crate::keys::{
    device_keys, stream_entry, StoreKey, DEVICE_CERTS_HASH, DEVICE_CONFIGS_HASH, DEVICE_HASHES,
    DEVICE_ONBOARD_CERTS_HASH, DEVICE_SERIALS_HASH,
};
use crate::manager::{audit_failure, TrustManager};

impl TrustManager {
    /// UUID of the registered device holding exactly this certificate.
    pub async fn device_check_cert(&self, cert: &Certificate) -> TrustResult<Option<Uuid>> {
        self.refresh().await?;
        Ok(self
            .cache
            .snapshot()
            .await
            .device_certs
            .get(&cert.identity())
            .copied())
    }

    /// Register a device certificate, optionally bound to the onboarding
    /// certificate and serial it presented. Returns the new UUID.
    pub async fn device_register(
        &self,
        cert: &Certificate,
        onboard: Option<&Certificate>,
        serial: &str,
    ) -> TrustResult<Uuid> {
        ensure_concrete_serial(serial)?;
        if let Some(existing) = self.device_check_cert(cert).await? {
            return Err(TrustError::AlreadyRegistered(existing));
        }

        let uuid = Uuid::new_v4();
        let op = self
            .coordinator
            .begin(PendingKind::RegisterDevice, Subject::Device(uuid), device_keys(uuid))
            .await?;

        if let Err(e) = self.persist_device(uuid, cert, onboard, serial).await {
            warn!(device = %uuid, error = %e, "Registration failed; rolling back");
            self.coordinator.roll_back(&op).await;
            return Err(audit_failure("device register", e));
        }
        if let Err(e) = self.coordinator.finish(&op).await {
            warn!(device = %uuid, error = %e, "Could not commit registration; rolling back");
            self.coordinator.roll_back(&op).await;
            return Err(audit_failure("device register", e));
        }

        let binding = DeviceBinding {
            onboard: onboard.map(Certificate::identity),
            serial: Some(serial.to_string()).filter(|s| !s.is_empty()),
        };
        let identity = cert.identity();
        self.cache
            .update(|s| s.insert_device(uuid, identity, binding))
            .await;
        AuditLog::record(AuditEvent::DeviceRegistered {
            uuid: uuid.to_string(),
            serial: Some(serial.to_string()).filter(|s| !s.is_empty()),
        });
        Ok(uuid)
    }

    async fn persist_device(
        &self,
        uuid: Uuid,
        cert: &Certificate,
        onboard: Option<&Certificate>,
        serial: &str,
    ) -> TrustResult<()> {
        let key = uuid.to_string();
        if let Some(onboard) = onboard {
            self.put(DEVICE_ONBOARD_CERTS_HASH, &key, onboard.to_pem().as_bytes())
                .await?;
        }
        if !serial.is_empty() {
            self.put(DEVICE_SERIALS_HASH, &key, serial.as_bytes()).await?;
        }
        self.store_config(uuid, &DeviceConfig::base(uuid)).await?;

        // seed entries so readers never see a missing stream
        for kind in TelemetryKind::ALL {
            let stream = kind.stream_for(uuid);
            self.store
                .stream_append(&stream, &stream_entry(b""), self.settings.stream_cap(kind))
                .await
                .map_err(|e| TrustError::store(format!("xadd {stream}"), e))?;
        }
        self.put(DEVICE_CERTS_HASH, &key, cert.to_pem().as_bytes()).await
    }

    async fn put(&self, hash: &str, key: &str, value: &[u8]) -> TrustResult<()> {
        self.store
            .hash_set(hash, key, value)
            .await
            .map_err(|e| TrustError::store(format!("hset {hash}[{key}]"), e))
    }

    /// Device certificate, onboarding certificate and serial. The serial is
    /// best effort: a failed read yields `None`.
    pub async fn device_get(&self, uuid: Uuid) -> TrustResult<DeviceDetails> {
        let key = uuid.to_string();
        let cert = self
            .read_cert(DEVICE_CERTS_HASH, &key)
            .await?
            .ok_or(TrustError::UnregisteredDevice(uuid))?;
        let onboard = self.read_cert(DEVICE_ONBOARD_CERTS_HASH, &key).await?;
        let serial = match self.store.hash_get(DEVICE_SERIALS_HASH, &key).await {
            Ok(v) => v.map(|b| String::from_utf8_lossy(&b).into_owned()),
            Err(e) => {
                warn!(device = %uuid, error = %e, "Could not read device serial");
                None
            }
        };
        Ok(DeviceDetails {
            uuid,
            cert,
            onboard,
            serial,
        })
    }

    async fn read_cert(&self, hash: &str, key: &str) -> TrustResult<Option<Certificate>> {
        let Some(pem) = self
            .store
            .hash_get(hash, key)
            .await
            .map_err(|e| TrustError::store(format!("hget {hash}[{key}]"), e))?
        else {
            return Ok(None);
        };
        Certificate::from_pem(&pem)
            .map(Some)
            .map_err(|e| TrustError::decode(format!("certificate {hash}[{key}]"), e))
    }

    /// All registered device UUIDs, in no particular order.
    pub async fn device_list(&self) -> TrustResult<Vec<Uuid>> {
        self.refresh().await?;
        Ok(self.cache.snapshot().await.devices.keys().copied().collect())
    }

    /// Drop every record of one device. Fails if nothing matched.
    pub async fn device_remove(&self, uuid: Uuid) -> TrustResult<()> {
        let keys = device_keys(uuid);
        let op = self
            .coordinator
            .begin(PendingKind::RemoveDevice, Subject::Device(uuid), keys.clone())
            .await?;
        let report = self.coordinator.drop_keys(&keys).await;
        if report.is_clean() {
            self.coordinator.finish(&op).await?;
        }
        if !report.is_clean() || report.deleted == 0 {
            self.cache.invalidate().await;
            return Err(audit_failure(
                "device remove",
                report.into_error(format!("remove device {uuid}")),
            ));
        }
        AuditLog::record(AuditEvent::DeviceRemoved { uuid: uuid.to_string() });
        self.force_refresh().await
    }

    /// Drop the records and streams of every device present right now,
    /// including half-written ones.
    pub async fn device_clear(&self) -> TrustResult<()> {
        let mut names = BTreeSet::new();
        for hash in DEVICE_HASHES {
            let fields = self
                .store
                .hash_get_all(hash)
                .await
                .map_err(|e| TrustError::store(format!("hgetall {hash}"), e))?;
            names.extend(fields.into_keys());
        }

        let mut uuids = Vec::with_capacity(names.len());
        let mut keys = Vec::new();
        for name in names {
            match Uuid::parse_str(&name) {
                Ok(u) => {
                    uuids.push(u);
                    keys.extend(device_keys(u));
                }
                Err(_) => {
                    warn!(key = %name, "Clearing device record with malformed UUID");
                    keys.extend(DEVICE_HASHES.iter().map(|h| StoreKey::field(h, name.clone())));
                }
            }
        }

        let op = self
            .coordinator
            .begin(PendingKind::ClearDevices, Subject::Devices(uuids.clone()), keys.clone())
            .await?;
        let report = self.coordinator.drop_keys(&keys).await;
        if !report.is_clean() {
            self.cache.invalidate().await;
            return Err(audit_failure(
                "device clear",
                report.into_error("remove all devices"),
            ));
        }
        self.coordinator.finish(&op).await?;
        self.cache.update(|s| s.remove_devices(&uuids)).await;
        AuditLog::record(AuditEvent::DevicesCleared { count: uuids.len() });
        Ok(())
    }
}

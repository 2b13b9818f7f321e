//! Per-device configuration documents and their change-detection hash.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use keystone_core::{ConfigResponse, DeviceConfig, TrustError, TrustResult};
use keystone_logging::{AuditEvent, AuditLog};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::keys::DEVICE_CONFIGS_HASH;
use crate::manager::TrustManager;

/// URL-safe base64 SHA-256 of the canonical JSON form of `config`.
pub fn config_hash(config: &DeviceConfig) -> TrustResult<String> {
    let canonical = serde_json::to_vec(config)
        .map_err(|e| TrustError::decode("device config", e))?;
    Ok(URL_SAFE.encode(Sha256::digest(&canonical)))
}

impl TrustManager {
    /// Stored config for `uuid`. A device with nothing stored gets the base
    /// document, which is persisted on first read.
    pub async fn get_config(&self, uuid: Uuid) -> TrustResult<DeviceConfig> {
        let key = uuid.to_string();
        let stored = self
            .store
            .hash_get(DEVICE_CONFIGS_HASH, &key)
            .await
            .map_err(|e| TrustError::store(format!("hget {DEVICE_CONFIGS_HASH}[{key}]"), e))?;

        let Some(bytes) = stored else {
            let config = DeviceConfig::base(uuid);
            self.store_config(uuid, &config).await?;
            debug!(device = %uuid, "Seeded base config");
            return Ok(config);
        };

        let config: DeviceConfig = serde_json::from_slice(&bytes)
            .map_err(|e| TrustError::decode(format!("config for {uuid}"), e))?;
        if !config.belongs_to(uuid) {
            return Err(TrustError::Decode(format!(
                "config stored under {uuid} names device {}",
                config.id.uuid
            )));
        }
        Ok(config)
    }

    pub async fn get_config_response(&self, uuid: Uuid) -> TrustResult<ConfigResponse> {
        let config = self.get_config(uuid).await?;
        let config_hash = config_hash(&config)?;
        Ok(ConfigResponse {
            config,
            config_hash,
        })
    }

    /// Replace the config of a registered device.
    pub async fn set_config(&self, uuid: Uuid, config: &DeviceConfig) -> TrustResult<()> {
        if !config.belongs_to(uuid) {
            return Err(TrustError::MismatchedIdentity {
                expected: uuid,
                found: config.id.uuid.clone(),
            });
        }
        // would serialize as a second `id` field
        if config.body.contains_key("id") {
            return Err(TrustError::InvalidInput(
                "config body carries its own `id` key".into(),
            ));
        }
        self.refresh().await?;
        if !self.cache.snapshot().await.devices.contains_key(&uuid) {
            return Err(TrustError::UnregisteredDevice(uuid));
        }
        self.store_config(uuid, config).await?;
        AuditLog::record(AuditEvent::ConfigChanged {
            uuid: uuid.to_string(),
            version: config.id.version.clone(),
        });
        Ok(())
    }

    pub(crate) async fn store_config(&self, uuid: Uuid, config: &DeviceConfig) -> TrustResult<()> {
        let key = uuid.to_string();
        let encoded = serde_json::to_vec(config)
            .map_err(|e| TrustError::decode(format!("config for {uuid}"), e))?;
        self.store
            .hash_set(DEVICE_CONFIGS_HASH, &key, &encoded)
            .await
            .map_err(|e| TrustError::store(format!("hset {DEVICE_CONFIGS_HASH}[{key}]"), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{manager, mint_cert};
    use keystone_core::BackingStore;
    use serde_json::json;

    #[tokio::test]
    async fn config_refers_to_its_device() {
        let (_store, mgr) = manager();
        let u = mgr.device_register(&mint_cert("dev"), None, "").await.unwrap();
        let config = mgr.get_config(u).await.unwrap();
        assert_eq!(config.id.uuid, u.to_string());
        assert_eq!(config.id.version, "4");
    }

    #[tokio::test]
    async fn first_read_persists_the_base_document() {
        let (store, mgr) = manager();
        let u = Uuid::new_v4();
        let config = mgr.get_config(u).await.unwrap();
        assert_eq!(config, DeviceConfig::base(u));
        assert!(store
            .hash_get(DEVICE_CONFIGS_HASH, &u.to_string())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn second_read_returns_the_seeded_document_without_writing() {
        let (store, mgr) = manager();
        let u = Uuid::new_v4();
        let first = mgr.get_config(u).await.unwrap();
        let writes = store.calls("hash_set").await;

        let second = mgr.get_config(u).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.calls("hash_set").await, writes);
    }

    #[tokio::test]
    async fn body_cannot_shadow_the_id() {
        let (store, mgr) = manager();
        let u = mgr.device_register(&mint_cert("dev"), None, "").await.unwrap();
        let before = mgr.get_config(u).await.unwrap();

        let mut config = before.clone();
        config.body.insert("id".into(), json!({"uuid": "other"}));
        assert!(matches!(
            mgr.set_config(u, &config).await,
            Err(TrustError::InvalidInput(_))
        ));
        assert_eq!(mgr.get_config(u).await.unwrap(), before);
        assert!(store.hash_get(DEVICE_CONFIGS_HASH, &u.to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn set_then_get_with_stable_hash() {
        let (_store, mgr) = manager();
        let u = mgr.device_register(&mint_cert("dev"), None, "").await.unwrap();
        let before = mgr.get_config_response(u).await.unwrap();
        assert_eq!(before.config_hash, mgr.get_config_response(u).await.unwrap().config_hash);

        let mut config = before.config.clone();
        config.body.insert("interval".into(), json!(30));
        mgr.set_config(u, &config).await.unwrap();

        let after = mgr.get_config_response(u).await.unwrap();
        assert_eq!(after.config, config);
        assert_ne!(after.config_hash, before.config_hash);
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let u = Uuid::new_v4();
        let mut a = DeviceConfig::base(u);
        a.body.insert("b".into(), json!(1));
        a.body.insert("a".into(), json!(2));
        let mut b = DeviceConfig::base(u);
        b.body.insert("a".into(), json!(2));
        b.body.insert("b".into(), json!(1));

        let h = config_hash(&a).unwrap();
        assert_eq!(h, config_hash(&b).unwrap());
        // 32 bytes in padded base64
        assert_eq!(h.len(), 44);
        assert!(!h.contains('+') && !h.contains('/'));
    }

    #[tokio::test]
    async fn set_rejects_foreign_or_unknown_devices() {
        let (_store, mgr) = manager();
        let u = mgr.device_register(&mint_cert("dev"), None, "").await.unwrap();
        let other = Uuid::new_v4();

        assert!(matches!(
            mgr.set_config(u, &DeviceConfig::base(other)).await,
            Err(TrustError::MismatchedIdentity { expected, .. }) if expected == u
        ));
        assert!(matches!(
            mgr.set_config(other, &DeviceConfig::base(other)).await,
            Err(TrustError::UnregisteredDevice(x)) if x == other
        ));
    }

    #[tokio::test]
    async fn stored_config_for_another_device_is_corrupt() {
        let (store, mgr) = manager();
        let u = Uuid::new_v4();
        let foreign = serde_json::to_vec(&DeviceConfig::base(Uuid::new_v4())).unwrap();
        store
            .hash_set(DEVICE_CONFIGS_HASH, &u.to_string(), &foreign)
            .await
            .unwrap();
        assert!(matches!(mgr.get_config(u).await, Err(TrustError::Decode(_))));
    }
}

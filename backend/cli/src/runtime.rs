//! Wiring from a prepared config to a ready trust manager.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use keystone_config::defaults::{
    DEFAULT_READ_BATCH, DEFAULT_RECOVERY_GRACE_SECS, DEFAULT_STREAM_CAP, DEFAULT_SWEEP_INTERVAL_SECS,
};
use keystone_config::KeystoneConfig;
use keystone_core::Certificate;
use keystone_logging::{init_logger, redact_sensitive_data, LogFormat};
use keystone_trust::{ManagerSettings, TrustManager};
use tracing::info;

pub fn manager_settings(config: &KeystoneConfig) -> ManagerSettings {
    let telemetry = config.telemetry.clone().unwrap_or_default();
    let recovery = config.recovery.clone().unwrap_or_default();
    let grace = recovery.grace_secs.unwrap_or(DEFAULT_RECOVERY_GRACE_SECS);
    let sweep = recovery
        .sweep_interval_secs
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    ManagerSettings {
        cache_timeout: Duration::from_secs(config.cache_timeout_secs()),
        logs_cap: telemetry.logs_cap.unwrap_or(DEFAULT_STREAM_CAP),
        info_cap: telemetry.info_cap.unwrap_or(DEFAULT_STREAM_CAP),
        metrics_cap: telemetry.metrics_cap.unwrap_or(DEFAULT_STREAM_CAP),
        read_batch: telemetry.read_batch.unwrap_or(DEFAULT_READ_BATCH),
        recovery_grace: Duration::from_secs(grace),
        sweep_interval: Duration::from_secs(sweep),
    }
}

pub fn init_logging(config: &KeystoneConfig) -> Result<()> {
    let dir = config.log_dir().map(PathBuf::from);
    init_logger(
        dir.as_deref(),
        config.log_level(),
        LogFormat::from_json_flag(config.log_json()),
    )
}

/// Connect to the configured store and build the manager, sweeping
/// interrupted operations first if configured to.
pub async fn open_manager(config: &KeystoneConfig) -> Result<TrustManager> {
    let url = config.store_url();
    let store = keystone_store::open_store(url)
        .await
        .with_context(|| format!("opening store {}", redact_sensitive_data(url)))?;
    let manager = TrustManager::open(store, manager_settings(config), config.sweep_on_start())
        .await
        .context("starting trust manager")?;
    info!(store = manager.name(), database = %redact_sensitive_data(&manager.database()), "Connected");
    Ok(manager)
}

pub async fn read_certificate(path: &Path) -> Result<Certificate> {
    let pem = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Certificate::from_pem(&pem).with_context(|| format!("parsing certificate {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_config::apply_all_defaults;
    use keystone_config::schema::{CacheConfig, TelemetryConfig};

    #[test]
    fn settings_follow_config() {
        let mut config = KeystoneConfig {
            cache: Some(CacheConfig {
                timeout_secs: Some(30),
            }),
            telemetry: Some(TelemetryConfig {
                metrics_cap: Some(99),
                ..Default::default()
            }),
            ..Default::default()
        };
        config = apply_all_defaults(config);
        let settings = manager_settings(&config);
        assert_eq!(settings.cache_timeout, Duration::from_secs(30));
        assert_eq!(settings.metrics_cap, 99);
        assert_eq!(settings.logs_cap, DEFAULT_STREAM_CAP);
        assert_eq!(settings.recovery_grace, Duration::from_secs(60));
        assert_eq!(settings.sweep_interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn memory_store_opens() {
        let config = KeystoneConfig {
            store: Some(keystone_config::schema::StoreConfig {
                url: Some("memory://".into()),
            }),
            ..Default::default()
        };
        let manager = open_manager(&config).await.unwrap();
        assert_eq!(manager.name(), "memory");
        assert!(manager.device_list().await.unwrap().is_empty());
    }
}

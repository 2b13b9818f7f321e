//! Config defaults: applies default values to a parsed config.

use crate::schema::{
    CacheConfig, KeystoneConfig, LoggingConfig, RecoveryConfig, StoreConfig, TelemetryConfig,
};

pub const DEFAULT_STORE_URL: &str = "redis://localhost:6379/0";

/// Refresh on every call unless configured otherwise.
pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 0;

/// Approximate entry cap of each telemetry stream.
pub const DEFAULT_STREAM_CAP: usize = 10_000;

pub const DEFAULT_READ_BATCH: usize = 256;

pub const DEFAULT_RECOVERY_GRACE_SECS: u64 = 60;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: KeystoneConfig) -> KeystoneConfig {
    let config = apply_store_defaults(config);
    let config = apply_cache_defaults(config);
    let config = apply_telemetry_defaults(config);
    let config = apply_recovery_defaults(config);
    apply_logging_defaults(config)
}

fn apply_store_defaults(mut config: KeystoneConfig) -> KeystoneConfig {
    let store = config.store.get_or_insert_with(StoreConfig::default);
    if store.url.is_none() {
        store.url = Some(DEFAULT_STORE_URL.to_string());
    }
    config
}

fn apply_cache_defaults(mut config: KeystoneConfig) -> KeystoneConfig {
    let cache = config.cache.get_or_insert_with(CacheConfig::default);
    if cache.timeout_secs.is_none() {
        cache.timeout_secs = Some(DEFAULT_CACHE_TIMEOUT_SECS);
    }
    config
}

fn apply_telemetry_defaults(mut config: KeystoneConfig) -> KeystoneConfig {
    let telemetry = config.telemetry.get_or_insert_with(TelemetryConfig::default);
    for cap in [
        &mut telemetry.logs_cap,
        &mut telemetry.info_cap,
        &mut telemetry.metrics_cap,
    ] {
        cap.get_or_insert(DEFAULT_STREAM_CAP);
    }
    telemetry.read_batch.get_or_insert(DEFAULT_READ_BATCH);
    config
}

fn apply_recovery_defaults(mut config: KeystoneConfig) -> KeystoneConfig {
    let recovery = config.recovery.get_or_insert_with(RecoveryConfig::default);
    recovery.sweep_on_start.get_or_insert(true);
    recovery.grace_secs.get_or_insert(DEFAULT_RECOVERY_GRACE_SECS);
    recovery
        .sweep_interval_secs
        .get_or_insert(DEFAULT_SWEEP_INTERVAL_SECS);
    config
}

fn apply_logging_defaults(mut config: KeystoneConfig) -> KeystoneConfig {
    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    if logging.level.is_none() {
        logging.level = Some(DEFAULT_LOG_LEVEL.to_string());
    }
    logging.json.get_or_insert(false);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_every_section() {
        let cfg = apply_all_defaults(KeystoneConfig::default());
        assert_eq!(cfg.store_url(), DEFAULT_STORE_URL);
        let telemetry = cfg.telemetry.as_ref().unwrap();
        assert_eq!(telemetry.logs_cap, Some(DEFAULT_STREAM_CAP));
        assert_eq!(telemetry.read_batch, Some(DEFAULT_READ_BATCH));
        assert_eq!(cfg.recovery.as_ref().unwrap().grace_secs, Some(60));
        assert_eq!(cfg.recovery.as_ref().unwrap().sweep_interval_secs, Some(300));
        assert!(cfg.log_dir().is_none());
    }

    #[test]
    fn keeps_explicit_values() {
        let mut cfg = KeystoneConfig::default();
        cfg.telemetry = Some(TelemetryConfig {
            info_cap: Some(5),
            ..Default::default()
        });
        let cfg = apply_all_defaults(cfg);
        let telemetry = cfg.telemetry.unwrap();
        assert_eq!(telemetry.info_cap, Some(5));
        assert_eq!(telemetry.logs_cap, Some(DEFAULT_STREAM_CAP));
    }
}

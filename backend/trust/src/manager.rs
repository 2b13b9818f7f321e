use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keystone_core::{
    BackingStore, Certificate, ConfigResponse, DeviceConfig, DeviceDetails, LogBundle,
    MetricsSnapshot, OnboardRecord, StatusReport, TelemetryKind, TrustError, TrustResult,
};
use keystone_logging::{AuditEvent, AuditLog};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TrustCache;
use crate::coordinator::{Coordinator, RecoveryReport};
use crate::telemetry::StreamReader;

pub const DEFAULT_STREAM_CAP: usize = 10_000;
pub const DEFAULT_READ_BATCH: usize = 256;
pub const DEFAULT_RECOVERY_GRACE: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Tunables for a [`TrustManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Trust cache TTL; zero refreshes on every call.
    pub cache_timeout: Duration,
    pub logs_cap: usize,
    pub info_cap: usize,
    pub metrics_cap: usize,
    /// Entries fetched per page by stream readers.
    pub read_batch: usize,
    /// Pending markers younger than this are left alone by recovery.
    pub recovery_grace: Duration,
    /// Period of [`TrustManager::run_recovery_sweeps`].
    pub sweep_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            cache_timeout: Duration::ZERO,
            logs_cap: DEFAULT_STREAM_CAP,
            info_cap: DEFAULT_STREAM_CAP,
            metrics_cap: DEFAULT_STREAM_CAP,
            read_batch: DEFAULT_READ_BATCH,
            recovery_grace: DEFAULT_RECOVERY_GRACE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl ManagerSettings {
    pub fn stream_cap(&self, kind: TelemetryKind) -> usize {
        match kind {
            TelemetryKind::Logs => self.logs_cap,
            TelemetryKind::Info => self.info_cap,
            TelemetryKind::Metrics => self.metrics_cap,
        }
    }
}

/// Device manager over a keyed-hash + stream backing store.
///
/// Operations are split across modules: `authorizer`, `onboard`, `registry`,
/// `config_store` and `telemetry` each add an `impl TrustManager` block.
pub struct TrustManager {
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) cache: TrustCache,
    pub(crate) coordinator: Coordinator,
    pub(crate) settings: ManagerSettings,
}

impl TrustManager {
    pub fn new(store: Arc<dyn BackingStore>, settings: ManagerSettings) -> Self {
        Self {
            cache: TrustCache::new(settings.cache_timeout),
            coordinator: Coordinator::new(store.clone()),
            store,
            settings,
        }
    }

    /// Build a manager and, if asked, resolve markers left by earlier crashes.
    pub async fn open(
        store: Arc<dyn BackingStore>,
        settings: ManagerSettings,
        sweep: bool,
    ) -> TrustResult<Self> {
        let manager = Self::new(store, settings);
        info!(
            store = manager.name(),
            database = %manager.database(),
            cache_timeout_secs = manager.cache.timeout().as_secs(),
            "Trust manager ready"
        );
        if sweep {
            let report = manager.recover().await?;
            if report.unresolved > 0 {
                warn!(unresolved = report.unresolved, "Some pending operations could not be resolved");
            }
        }
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn database(&self) -> String {
        self.store.database()
    }

    pub fn max_log_entries(&self) -> usize {
        self.settings.logs_cap
    }

    pub fn max_info_entries(&self) -> usize {
        self.settings.info_cap
    }

    pub fn max_metric_entries(&self) -> usize {
        self.settings.metrics_cap
    }

    pub fn set_cache_timeout(&self, timeout: Duration) {
        self.cache.set_timeout(timeout);
    }

    pub(crate) async fn refresh(&self) -> TrustResult<()> {
        self.cache.refresh(self.store.as_ref()).await.map(|_| ())
    }

    /// Drop the cached snapshot's freshness and reload now.
    pub(crate) async fn force_refresh(&self) -> TrustResult<()> {
        self.cache.invalidate().await;
        self.refresh().await
    }

    /// Resolve pending multi-key operations older than the grace period.
    pub async fn recover(&self) -> TrustResult<RecoveryReport> {
        let report = self.coordinator.recover(self.settings.recovery_grace).await?;
        if report.touched() {
            self.cache.invalidate().await;
            debug!(discarded = report.discarded, deferred = report.deferred, "Recovery sweep done");
            AuditLog::record(AuditEvent::Recovered {
                rolled_back: report.rolled_back,
                completed: report.completed,
            });
        }
        Ok(report)
    }

    /// Sweep pending markers every `sweep_interval`, forever, so markers
    /// deferred by the grace period get resolved without a restart.
    /// Failed sweeps are logged and retried on the next tick.
    pub async fn run_recovery_sweeps(&self) {
        let every = self.settings.sweep_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.recover().await {
                Ok(report) if report.unresolved > 0 => {
                    warn!(unresolved = report.unresolved, "Some pending operations could not be resolved");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Recovery sweep failed"),
            }
        }
    }
}

/// Record a failed trust-store mutation in the audit log and pass the error on.
pub(crate) fn audit_failure(operation: &str, err: TrustError) -> TrustError {
    AuditLog::record(AuditEvent::Failed {
        operation: operation.to_string(),
        error: err.to_string(),
    });
    err
}

/// The operations an onboarding/config API needs from a device manager.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    async fn onboard_check(&self, cert: &Certificate, serial: &str) -> TrustResult<()>;
    async fn onboard_register(&self, cert: &Certificate, serials: &[String]) -> TrustResult<()>;
    async fn onboard_get(&self, cn: &str) -> TrustResult<OnboardRecord>;
    async fn onboard_list(&self) -> TrustResult<Vec<String>>;
    async fn onboard_remove(&self, cn: &str) -> TrustResult<()>;
    async fn onboard_clear(&self) -> TrustResult<()>;

    async fn device_check_cert(&self, cert: &Certificate) -> TrustResult<Option<Uuid>>;
    async fn device_register(
        &self,
        cert: &Certificate,
        onboard: Option<&Certificate>,
        serial: &str,
    ) -> TrustResult<Uuid>;
    async fn device_get(&self, uuid: Uuid) -> TrustResult<DeviceDetails>;
    async fn device_list(&self) -> TrustResult<Vec<Uuid>>;
    async fn device_remove(&self, uuid: Uuid) -> TrustResult<()>;
    async fn device_clear(&self) -> TrustResult<()>;

    async fn get_config(&self, uuid: Uuid) -> TrustResult<DeviceConfig>;
    async fn get_config_response(&self, uuid: Uuid) -> TrustResult<ConfigResponse>;
    async fn set_config(&self, uuid: Uuid, config: &DeviceConfig) -> TrustResult<()>;

    async fn write_info(&self, msg: &StatusReport) -> TrustResult<()>;
    async fn write_logs(&self, msg: &LogBundle) -> TrustResult<()>;
    async fn write_metrics(&self, msg: &MetricsSnapshot) -> TrustResult<()>;
    fn get_logs_reader(&self, uuid: Uuid) -> StreamReader;
    fn get_info_reader(&self, uuid: Uuid) -> StreamReader;
    fn get_metrics_reader(&self, uuid: Uuid) -> StreamReader;
}

#[async_trait]
impl DeviceManager for TrustManager {
    async fn onboard_check(&self, cert: &Certificate, serial: &str) -> TrustResult<()> {
        TrustManager::onboard_check(self, cert, serial).await
    }

    async fn onboard_register(&self, cert: &Certificate, serials: &[String]) -> TrustResult<()> {
        TrustManager::onboard_register(self, cert, serials).await
    }

    async fn onboard_get(&self, cn: &str) -> TrustResult<OnboardRecord> {
        TrustManager::onboard_get(self, cn).await
    }

    async fn onboard_list(&self) -> TrustResult<Vec<String>> {
        TrustManager::onboard_list(self).await
    }

    async fn onboard_remove(&self, cn: &str) -> TrustResult<()> {
        TrustManager::onboard_remove(self, cn).await
    }

    async fn onboard_clear(&self) -> TrustResult<()> {
        TrustManager::onboard_clear(self).await
    }

    async fn device_check_cert(&self, cert: &Certificate) -> TrustResult<Option<Uuid>> {
        TrustManager::device_check_cert(self, cert).await
    }

    async fn device_register(
        &self,
        cert: &Certificate,
        onboard: Option<&Certificate>,
        serial: &str,
    ) -> TrustResult<Uuid> {
        TrustManager::device_register(self, cert, onboard, serial).await
    }

    async fn device_get(&self, uuid: Uuid) -> TrustResult<DeviceDetails> {
        TrustManager::device_get(self, uuid).await
    }

    async fn device_list(&self) -> TrustResult<Vec<Uuid>> {
        TrustManager::device_list(self).await
    }

    async fn device_remove(&self, uuid: Uuid) -> TrustResult<()> {
        TrustManager::device_remove(self, uuid).await
    }

    async fn device_clear(&self) -> TrustResult<()> {
        TrustManager::device_clear(self).await
    }

    async fn get_config(&self, uuid: Uuid) -> TrustResult<DeviceConfig> {
        TrustManager::get_config(self, uuid).await
    }

    async fn get_config_response(&self, uuid: Uuid) -> TrustResult<ConfigResponse> {
        TrustManager::get_config_response(self, uuid).await
    }

    async fn set_config(&self, uuid: Uuid, config: &DeviceConfig) -> TrustResult<()> {
        TrustManager::set_config(self, uuid, config).await
    }

    async fn write_info(&self, msg: &StatusReport) -> TrustResult<()> {
        self.write_telemetry(msg).await
    }

    async fn write_logs(&self, msg: &LogBundle) -> TrustResult<()> {
        self.write_telemetry(msg).await
    }

    async fn write_metrics(&self, msg: &MetricsSnapshot) -> TrustResult<()> {
        self.write_telemetry(msg).await
    }

    fn get_logs_reader(&self, uuid: Uuid) -> StreamReader {
        self.reader(TelemetryKind::Logs, uuid)
    }

    fn get_info_reader(&self, uuid: Uuid) -> StreamReader {
        self.reader(TelemetryKind::Info, uuid)
    }

    fn get_metrics_reader(&self, uuid: Uuid) -> StreamReader {
        self.reader(TelemetryKind::Metrics, uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{PendingKind, Subject};
    use crate::keys::{device_keys, PENDING_OPS_HASH};
    use crate::testutil::manager_with;

    #[tokio::test]
    async fn background_sweeps_resolve_leftover_markers() {
        let (store, mgr) = manager_with(ManagerSettings {
            sweep_interval: Duration::from_millis(10),
            ..ManagerSettings::default()
        });
        let u = Uuid::new_v4();
        mgr.coordinator
            .begin(PendingKind::RemoveDevice, Subject::Device(u), device_keys(u))
            .await
            .unwrap();

        let swept = tokio::time::timeout(Duration::from_millis(100), mgr.run_recovery_sweeps()).await;
        assert!(swept.is_err(), "sweeps run until cancelled");
        assert!(!store.key_exists(PENDING_OPS_HASH).await);
    }

    #[tokio::test]
    async fn reports_store_identity_and_limits() {
        let (_store, mgr) = manager_with(ManagerSettings {
            logs_cap: 10,
            info_cap: 20,
            metrics_cap: 30,
            ..ManagerSettings::default()
        });
        assert_eq!(mgr.name(), "memory");
        assert_eq!(
            (mgr.max_log_entries(), mgr.max_info_entries(), mgr.max_metric_entries()),
            (10, 20, 30)
        );
        mgr.set_cache_timeout(Duration::from_secs(30));
        assert_eq!(mgr.cache.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn failures_pass_through_the_audit_log() {
        let err = audit_failure("device remove", TrustError::UnregisteredDevice(Uuid::nil()));
        assert!(matches!(err, TrustError::UnregisteredDevice(u) if u.is_nil()));
    }
}

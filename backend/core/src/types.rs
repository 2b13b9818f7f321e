use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cert::Certificate;

/// Literal serial that lets an onboarding certificate accept any serial.
pub const WILDCARD_SERIAL: &str = "*";

/// Config schema version written into freshly seeded documents.
pub const BASE_CONFIG_VERSION: &str = "4";

/// Identity block of a device configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigId {
    pub uuid: String,
    pub version: String,
}

/// Per-device configuration document.
///
/// The schema beyond `id` belongs to the caller; it is kept as an ordered JSON
/// object so that its serialization is canonical. `body` must not carry an
/// `id` key of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: ConfigId,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl DeviceConfig {
    /// Fresh document for a device with no stored configuration.
    pub fn base(uuid: Uuid) -> Self {
        Self {
            id: ConfigId {
                uuid: uuid.to_string(),
                version: BASE_CONFIG_VERSION.to_string(),
            },
            body: serde_json::Map::new(),
        }
    }

    /// Whether the embedded id refers to `uuid`.
    pub fn belongs_to(&self, uuid: Uuid) -> bool {
        Uuid::parse_str(&self.id.uuid).map(|u| u == uuid).unwrap_or(false)
    }
}

/// Config plus its change-detection hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub config: DeviceConfig,
    /// URL-safe base64 SHA-256 of the canonical JSON serialization.
    pub config_hash: String,
}

/// Everything stored about one registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDetails {
    pub uuid: Uuid,
    pub cert: Certificate,
    pub onboard: Option<Certificate>,
    pub serial: Option<String>,
}

/// An onboarding certificate with its accepted serials.
#[derive(Debug, Clone, PartialEq)]
pub struct OnboardRecord {
    pub cert: Certificate,
    pub serials: Vec<String>,
}

/// The three per-device telemetry streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    Logs,
    Info,
    Metrics,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 3] = [TelemetryKind::Info, TelemetryKind::Metrics, TelemetryKind::Logs];

    pub fn stream_prefix(self) -> &'static str {
        match self {
            TelemetryKind::Logs => "LOGS_EVE_",
            TelemetryKind::Info => "INFO_EVE_",
            TelemetryKind::Metrics => "METRICS_EVE_",
        }
    }

    /// Stream name for one device.
    pub fn stream_for(self, uuid: Uuid) -> String {
        format!("{}{}", self.stream_prefix(), uuid)
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryKind::Logs => write!(f, "logs"),
            TelemetryKind::Info => write!(f, "info"),
            TelemetryKind::Metrics => write!(f, "metrics"),
        }
    }
}

/// A telemetry payload that knows which stream it belongs to.
pub trait TelemetryMessage: Serialize + Send + Sync {
    const KIND: TelemetryKind;

    /// Device UUID as carried in the message, unvalidated.
    fn device_id(&self) -> &str;
}

/// A bundle of device log lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBundle {
    pub dev_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub log: Vec<serde_json::Value>,
}

/// A device status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub dev_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub report: serde_json::Value,
}

/// A metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub dev_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: serde_json::Value,
}

impl TelemetryMessage for LogBundle {
    const KIND: TelemetryKind = TelemetryKind::Logs;

    fn device_id(&self) -> &str {
        &self.dev_id
    }
}

impl TelemetryMessage for StatusReport {
    const KIND: TelemetryKind = TelemetryKind::Info;

    fn device_id(&self) -> &str {
        &self.dev_id
    }
}

impl TelemetryMessage for MetricsSnapshot {
    const KIND: TelemetryKind = TelemetryKind::Metrics;

    fn device_id(&self) -> &str {
        &self.dev_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_config_refers_to_its_device() {
        let u = Uuid::new_v4();
        let cfg = DeviceConfig::base(u);
        assert!(cfg.belongs_to(u));
        assert!(!cfg.belongs_to(Uuid::new_v4()));
        assert!(cfg.body.is_empty());
    }

    #[test]
    fn config_body_is_flattened_next_to_id() {
        let raw = r#"{"id":{"uuid":"a","version":"4"},"reboot":{"counter":3}}"#;
        let cfg: DeviceConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.id.uuid, "a");
        assert_eq!(cfg.body["reboot"]["counter"], 3);
        assert_eq!(serde_json::to_string(&cfg).unwrap(), raw);
    }

    #[test]
    fn stream_names_use_fixed_prefixes() {
        let u = Uuid::nil();
        assert_eq!(
            TelemetryKind::Logs.stream_for(u),
            "LOGS_EVE_00000000-0000-0000-0000-000000000000"
        );
        assert!(TelemetryKind::Info.stream_for(u).starts_with("INFO_EVE_"));
        assert!(TelemetryKind::Metrics.stream_for(u).starts_with("METRICS_EVE_"));
    }
}

//! Audit Log
//!
//! One structured `keystone_audit` event per trust-store mutation, so the
//! rolling NDJSON file doubles as an audit trail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::redact::redact_sensitive_data;

pub const AUDIT_TARGET: &str = "keystone_audit";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    OnboardRegistered { cn: String, serials: usize },
    OnboardRemoved { cn: String },
    OnboardCleared,
    DeviceRegistered { uuid: String, serial: Option<String> },
    DeviceRemoved { uuid: String },
    DevicesCleared { count: usize },
    ConfigChanged { uuid: String, version: String },
    Recovered { rolled_back: usize, completed: usize },
    Failed { operation: String, error: String },
}

#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

pub struct AuditLog;

impl AuditLog {
    /// Emit an audit event; free-text fields are redacted first.
    pub fn record(mut event: AuditEvent) -> AuditEntry {
        if let AuditEvent::Failed { error, .. } = &mut event {
            *error = redact_sensitive_data(error);
        }
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&entry.event).unwrap_or_default();
        info!(target: AUDIT_TARGET, event = %json, "Trust store audit");
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_text_is_redacted() {
        let entry = AuditLog::record(AuditEvent::Failed {
            operation: "onboard add".into(),
            error: "decode: -----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----".into(),
        });
        match entry.event {
            AuditEvent::Failed { error, .. } => assert!(!error.contains("AAAA")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(AuditEvent::DeviceRemoved { uuid: "u".into() }).unwrap();
        assert_eq!(json["type"], "device_removed");
        assert_eq!(json["uuid"], "u");
    }
}

//! Store layout.
//!
//! Apart from telemetry streams everything lives in hashes:
//!
//! | hash | key | value |
//! |---|---|---|
//! | `ONBOARD_CERTS` | CN | certificate PEM |
//! | `ONBOARD_SERIALS` | CN | MessagePack list of serials |
//! | `DEVICE_SERIALS` | UUID | serial string |
//! | `DEVICE_ONBOARD_CERTS` | UUID | onboarding certificate PEM |
//! | `DEVICE_CERTS` | UUID | device certificate PEM |
//! | `DEVICE_CONFIGS` | UUID | config JSON |
//! | `PENDING_OPS` | op UUID | pending multi-key operation marker |
//!
//! Streams are `LOGS_EVE_<uuid>`, `INFO_EVE_<uuid>` and `METRICS_EVE_<uuid>`,
//! each entry carrying `version` and `object` fields.

use std::fmt;

use keystone_core::TelemetryKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ONBOARD_CERTS_HASH: &str = "ONBOARD_CERTS";
pub const ONBOARD_SERIALS_HASH: &str = "ONBOARD_SERIALS";
pub const DEVICE_SERIALS_HASH: &str = "DEVICE_SERIALS";
pub const DEVICE_ONBOARD_CERTS_HASH: &str = "DEVICE_ONBOARD_CERTS";
pub const DEVICE_CERTS_HASH: &str = "DEVICE_CERTS";
pub const DEVICE_CONFIGS_HASH: &str = "DEVICE_CONFIGS";
pub const PENDING_OPS_HASH: &str = "PENDING_OPS";

/// Hashes holding one field per device UUID.
pub const DEVICE_HASHES: [&str; 4] = [
    DEVICE_CERTS_HASH,
    DEVICE_CONFIGS_HASH,
    DEVICE_ONBOARD_CERTS_HASH,
    DEVICE_SERIALS_HASH,
];

pub const STREAM_ENTRY_VERSION: &str = "1";
pub const STREAM_VERSION_FIELD: &str = "version";
pub const STREAM_OBJECT_FIELD: &str = "object";

/// One addressable record in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreKey {
    /// A single field of a hash.
    Field { hash: String, key: String },
    /// A whole top-level key (hash or stream).
    Key { name: String },
}

impl StoreKey {
    pub fn field(hash: &str, key: impl Into<String>) -> Self {
        StoreKey::Field {
            hash: hash.to_string(),
            key: key.into(),
        }
    }

    pub fn key(name: impl Into<String>) -> Self {
        StoreKey::Key { name: name.into() }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Field { hash, key } => write!(f, "{hash}[{key}]"),
            StoreKey::Key { name } => write!(f, "{name}"),
        }
    }
}

/// Every record a registered device can own: four hash fields and three streams.
pub fn device_keys(uuid: Uuid) -> Vec<StoreKey> {
    let k = uuid.to_string();
    DEVICE_HASHES
        .iter()
        .map(|hash| StoreKey::field(hash, k.clone()))
        .chain(
            TelemetryKind::ALL
                .iter()
                .map(|kind| StoreKey::key(kind.stream_for(uuid))),
        )
        .collect()
}

/// Stream entry fields for a payload.
pub fn stream_entry(payload: &[u8]) -> [(&'static str, &[u8]); 2] {
    [
        (STREAM_VERSION_FIELD, STREAM_ENTRY_VERSION.as_bytes()),
        (STREAM_OBJECT_FIELD, payload),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_owns_seven_records() {
        let u = Uuid::new_v4();
        let keys = device_keys(u);
        assert_eq!(keys.len(), 7);
        assert!(keys.contains(&StoreKey::field(DEVICE_CERTS_HASH, u.to_string())));
        assert!(keys.contains(&StoreKey::key(format!("LOGS_EVE_{u}"))));
        assert_eq!(
            StoreKey::field(DEVICE_SERIALS_HASH, "x").to_string(),
            "DEVICE_SERIALS[x]"
        );
    }
}

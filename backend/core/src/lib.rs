//! Core types for the Keystone device trust backend: the error type, the
//! certificate codec, device/config/telemetry data, and the backing-store seam.

pub mod cert;
pub mod error;
pub mod traits;
pub mod types;

pub use cert::{CertIdentity, Certificate};
pub use error::{TrustError, TrustResult};
pub use traits::{BackingStore, StoreError, StoreResult, StreamCursor, StreamRecord};
pub use types::{
    ConfigId, ConfigResponse, DeviceConfig, DeviceDetails, LogBundle, MetricsSnapshot,
    OnboardRecord, StatusReport, TelemetryKind, TelemetryMessage, BASE_CONFIG_VERSION,
    WILDCARD_SERIAL,
};

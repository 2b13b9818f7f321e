//! Keystone trust engine: onboarding authorization, device registry, config
//! documents and telemetry streams over a [`keystone_core::BackingStore`].

pub mod authorizer;
pub mod cache;
pub mod config_store;
pub mod coordinator;
pub mod keys;
pub mod manager;
pub mod onboard;
pub mod registry;
pub mod telemetry;

#[cfg(test)]
mod testutil;

pub use cache::{TrustCache, TrustSnapshot};
pub use config_store::config_hash;
pub use coordinator::{PendingKind, PendingOp, RecoveryReport};
pub use manager::{
    DeviceManager, ManagerSettings, TrustManager, DEFAULT_READ_BATCH, DEFAULT_RECOVERY_GRACE,
    DEFAULT_STREAM_CAP, DEFAULT_SWEEP_INTERVAL,
};
pub use telemetry::StreamReader;

//! Onboarding authorization: is this (certificate, serial) pair allowed to
//! register a new device?

use keystone_core::{Certificate, TrustError, TrustResult, WILDCARD_SERIAL};
use tracing::debug;

use crate::cache::TrustSnapshot;
use crate::manager::TrustManager;

/// The wildcard is a set member, never a concrete device serial.
pub(crate) fn ensure_concrete_serial(serial: &str) -> TrustResult<()> {
    if serial == WILDCARD_SERIAL {
        return Err(TrustError::InvalidSerial(format!(
            "{WILDCARD_SERIAL} is reserved and cannot identify a device"
        )));
    }
    Ok(())
}

/// Serial validity, then single-use, against one snapshot.
pub(crate) fn authorize(snap: &TrustSnapshot, cert: &Certificate, serial: &str) -> TrustResult<()> {
    let identity = cert.identity();
    let entry = snap
        .onboard_certs
        .get(&identity)
        .ok_or(TrustError::UnknownCertificate)?;
    if !entry.accepts(serial) {
        return Err(TrustError::InvalidSerial(serial.to_string()));
    }
    if let Some(device) = snap.device_for_serial(&identity, serial) {
        debug!(device = %device, serial, "Serial already consumed");
        return Err(TrustError::SerialAlreadyUsed(serial.to_string()));
    }
    Ok(())
}

impl TrustManager {
    /// Check that `cert` is a known onboarding certificate, that it accepts
    /// `serial`, and that no registered device already used the pair.
    pub async fn onboard_check(&self, cert: &Certificate, serial: &str) -> TrustResult<()> {
        ensure_concrete_serial(serial)?;
        self.refresh().await?;
        let snap = self.cache.snapshot().await;
        authorize(&snap, cert, serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DeviceBinding, OnboardEntry};
    use crate::testutil::{manager, mint_cert};
    use uuid::Uuid;

    fn snapshot_with(onboard: &Certificate, serials: &[&str]) -> TrustSnapshot {
        let mut snap = TrustSnapshot::default();
        snap.insert_onboard(
            onboard.identity(),
            OnboardEntry::new(onboard.common_name(), serials.iter().map(|s| s.to_string())),
        );
        snap
    }

    #[test]
    fn membership_then_reuse() {
        let onboard = mint_cert("factory-1");
        let mut snap = snapshot_with(&onboard, &["S1", "S2"]);
        assert!(authorize(&snap, &onboard, "S1").is_ok());
        assert!(matches!(
            authorize(&snap, &onboard, "S9"),
            Err(TrustError::InvalidSerial(_))
        ));

        snap.insert_device(
            Uuid::new_v4(),
            mint_cert("dev").identity(),
            DeviceBinding {
                onboard: Some(onboard.identity()),
                serial: Some("S1".into()),
            },
        );
        assert!(matches!(
            authorize(&snap, &onboard, "S1"),
            Err(TrustError::SerialAlreadyUsed(_))
        ));
        assert!(authorize(&snap, &onboard, "S2").is_ok());
    }

    #[test]
    fn wildcard_accepts_any_unused_serial() {
        let onboard = mint_cert("factory-1");
        let mut snap = snapshot_with(&onboard, &["*"]);
        assert!(authorize(&snap, &onboard, "anything").is_ok());

        snap.insert_device(
            Uuid::new_v4(),
            mint_cert("dev").identity(),
            DeviceBinding {
                onboard: Some(onboard.identity()),
                serial: Some("anything".into()),
            },
        );
        // the stored concrete serial is still single-use
        assert!(matches!(
            authorize(&snap, &onboard, "anything"),
            Err(TrustError::SerialAlreadyUsed(_))
        ));
        assert!(authorize(&snap, &onboard, "other").is_ok());
    }

    #[test]
    fn unknown_certificate() {
        let snap = snapshot_with(&mint_cert("factory-1"), &["*"]);
        assert!(matches!(
            authorize(&snap, &mint_cert("factory-1"), "S1"),
            Err(TrustError::UnknownCertificate)
        ));
    }

    #[tokio::test]
    async fn literal_wildcard_is_rejected_before_touching_the_store() {
        let (store, mgr) = manager();
        let err = mgr.onboard_check(&mint_cert("factory-1"), "*").await.unwrap_err();
        assert!(matches!(err, TrustError::InvalidSerial(_)));
        assert_eq!(store.calls("hash_get_all").await, 0);
    }
}

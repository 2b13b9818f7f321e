//! Onboarding-certificate administration.

use std::collections::BTreeSet;

use keystone_core::{Certificate, OnboardRecord, TrustError, TrustResult};
use keystone_logging::{AuditEvent, AuditLog};

use crate::cache::OnboardEntry;
use crate::coordinator::{PendingKind, Subject};
use crate::keys::{StoreKey, ONBOARD_CERTS_HASH, ONBOARD_SERIALS_HASH};
use crate::manager::{audit_failure, TrustManager};

fn require_cn(cn: &str) -> TrustResult<()> {
    if cn.trim().is_empty() {
        return Err(TrustError::InvalidInput("empty common name".into()));
    }
    Ok(())
}

impl TrustManager {
    /// Store `cert` under its Common Name and replace its serial set.
    ///
    /// The serial list is written before the certificate, so a reader never
    /// finds a certificate whose serials are still missing.
    pub async fn onboard_register(&self, cert: &Certificate, serials: &[String]) -> TrustResult<()> {
        let cn = cert.common_name().to_string();
        if cn.is_empty() {
            return Err(TrustError::InvalidInput(
                "onboarding certificate has no common name".into(),
            ));
        }
        let encoded = rmp_serde::to_vec(serials)
            .map_err(|e| TrustError::InvalidInput(format!("unserializable serials: {e}")))?;

        // a leftover removal marker would hide the new record, or drop it on recovery
        let settled = self
            .coordinator
            .settle_onboard(&cn)
            .await
            .map_err(|e| audit_failure("onboard register", e))?;
        if settled > 0 {
            self.cache.invalidate().await;
        }

        self.store
            .hash_set(ONBOARD_SERIALS_HASH, &cn, &encoded)
            .await
            .map_err(|e| TrustError::store(format!("hset {ONBOARD_SERIALS_HASH}[{cn}]"), e))?;
        self.store
            .hash_set(ONBOARD_CERTS_HASH, &cn, cert.to_pem().as_bytes())
            .await
            .map_err(|e| TrustError::store(format!("hset {ONBOARD_CERTS_HASH}[{cn}]"), e))?;

        let entry = OnboardEntry::new(cn.clone(), serials.iter().cloned());
        let identity = cert.identity();
        self.cache.update(|s| s.insert_onboard(identity, entry)).await;
        AuditLog::record(AuditEvent::OnboardRegistered {
            cn,
            serials: serials.len(),
        });
        Ok(())
    }

    pub async fn onboard_get(&self, cn: &str) -> TrustResult<OnboardRecord> {
        require_cn(cn)?;
        let pem = self
            .store
            .hash_get(ONBOARD_CERTS_HASH, cn)
            .await
            .map_err(|e| TrustError::store(format!("hget {ONBOARD_CERTS_HASH}[{cn}]"), e))?
            .ok_or(TrustError::UnknownCertificate)?;
        let cert = Certificate::from_pem(&pem)
            .map_err(|e| TrustError::decode(format!("onboarding certificate {cn}"), e))?;

        let raw = self
            .store
            .hash_get(ONBOARD_SERIALS_HASH, cn)
            .await
            .map_err(|e| TrustError::store(format!("hget {ONBOARD_SERIALS_HASH}[{cn}]"), e))?
            .ok_or_else(|| TrustError::Decode(format!("no serial list stored for {cn}")))?;
        let serials: Vec<String> = rmp_serde::from_slice(&raw)
            .map_err(|e| TrustError::decode(format!("onboard serials for {cn}"), e))?;

        Ok(OnboardRecord { cert, serials })
    }

    /// Distinct Common Names of all known onboarding certificates, sorted.
    pub async fn onboard_list(&self) -> TrustResult<Vec<String>> {
        self.refresh().await?;
        let snap = self.cache.snapshot().await;
        let mut cns: Vec<String> = snap
            .onboard_certs
            .values()
            .map(|e| e.common_name.clone())
            .collect();
        cns.sort();
        cns.dedup();
        Ok(cns)
    }

    pub async fn onboard_remove(&self, cn: &str) -> TrustResult<()> {
        require_cn(cn)?;
        let keys = vec![
            StoreKey::field(ONBOARD_SERIALS_HASH, cn),
            StoreKey::field(ONBOARD_CERTS_HASH, cn),
        ];
        let op = self
            .coordinator
            .begin(PendingKind::RemoveOnboard, Subject::Onboard(cn.to_string()), keys.clone())
            .await?;
        let report = self.coordinator.drop_keys(&keys).await;
        if report.is_clean() {
            self.coordinator.finish(&op).await?;
        }
        if !report.is_clean() || report.deleted == 0 {
            self.cache.invalidate().await;
            return Err(audit_failure(
                "onboard remove",
                report.into_error(format!("remove onboarding certificate {cn}")),
            ));
        }
        AuditLog::record(AuditEvent::OnboardRemoved { cn: cn.to_string() });
        self.force_refresh().await
    }

    /// Drop every onboarding certificate and serial list present right now.
    pub async fn onboard_clear(&self) -> TrustResult<()> {
        let mut cns = BTreeSet::new();
        for hash in [ONBOARD_CERTS_HASH, ONBOARD_SERIALS_HASH] {
            let fields = self
                .store
                .hash_get_all(hash)
                .await
                .map_err(|e| TrustError::store(format!("hgetall {hash}"), e))?;
            cns.extend(fields.into_keys());
        }
        let cns: Vec<String> = cns.into_iter().collect();
        let keys: Vec<StoreKey> = cns
            .iter()
            .flat_map(|cn| {
                [
                    StoreKey::field(ONBOARD_SERIALS_HASH, cn.clone()),
                    StoreKey::field(ONBOARD_CERTS_HASH, cn.clone()),
                ]
            })
            .collect();

        let op = self
            .coordinator
            .begin(PendingKind::ClearOnboard, Subject::Onboards(cns.clone()), keys.clone())
            .await?;
        let report = self.coordinator.drop_keys(&keys).await;
        if !report.is_clean() {
            self.cache.invalidate().await;
            return Err(audit_failure(
                "onboard clear",
                report.into_error("remove all onboarding certificates"),
            ));
        }
        self.coordinator.finish(&op).await?;
        self.cache
            .update(|s| s.onboard_certs.retain(|_, e| !cns.contains(&e.common_name)))
            .await;
        AuditLog::record(AuditEvent::OnboardCleared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{manager, mint_cert, serials};
    use keystone_core::BackingStore;

    #[tokio::test]
    async fn register_get_list_round_trip() {
        let (_store, mgr) = manager();
        let c1 = mint_cert("factory-1");
        let c2 = mint_cert("factory-2");
        mgr.onboard_register(&c1, &serials(&["S1", "S2"])).await.unwrap();
        mgr.onboard_register(&c2, &serials(&["*"])).await.unwrap();

        let record = mgr.onboard_get("factory-1").await.unwrap();
        assert_eq!(record.cert, c1);
        assert_eq!(record.serials, serials(&["S1", "S2"]));
        assert_eq!(mgr.onboard_list().await.unwrap(), vec!["factory-1", "factory-2"]);
    }

    #[tokio::test]
    async fn reregistering_replaces_the_serial_set() {
        let (_store, mgr) = manager();
        let c1 = mint_cert("factory-1");
        mgr.onboard_register(&c1, &serials(&["S1"])).await.unwrap();
        mgr.onboard_register(&c1, &serials(&["S2"])).await.unwrap();

        assert!(mgr.onboard_check(&c1, "S2").await.is_ok());
        assert!(matches!(
            mgr.onboard_check(&c1, "S1").await,
            Err(TrustError::InvalidSerial(_))
        ));
    }

    #[tokio::test]
    async fn get_reports_missing_and_empty_names() {
        let (_store, mgr) = manager();
        assert!(matches!(
            mgr.onboard_get("nobody").await,
            Err(TrustError::UnknownCertificate)
        ));
        assert!(matches!(mgr.onboard_get(" ").await, Err(TrustError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn get_fails_on_corrupt_serials() {
        let (store, mgr) = manager();
        mgr.onboard_register(&mint_cert("factory-1"), &serials(&["S1"]))
            .await
            .unwrap();
        store
            .hash_set(ONBOARD_SERIALS_HASH, "factory-1", b"\xc1")
            .await
            .unwrap();
        assert!(matches!(
            mgr.onboard_get("factory-1").await,
            Err(TrustError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn remove_revokes_onboarding() {
        let (_store, mgr) = manager();
        let c1 = mint_cert("factory-1");
        mgr.onboard_register(&c1, &serials(&["S1"])).await.unwrap();
        mgr.onboard_remove("factory-1").await.unwrap();

        assert!(mgr.onboard_list().await.unwrap().is_empty());
        assert!(matches!(
            mgr.onboard_check(&c1, "S1").await,
            Err(TrustError::UnknownCertificate)
        ));
        assert!(matches!(
            mgr.onboard_remove("factory-1").await,
            Err(TrustError::BackingStore { .. })
        ));
    }

    #[tokio::test]
    async fn clear_empties_store_and_cache() {
        let (store, mgr) = manager();
        let c1 = mint_cert("factory-1");
        mgr.onboard_register(&c1, &serials(&["S1"])).await.unwrap();
        mgr.onboard_register(&mint_cert("factory-2"), &serials(&["S1"]))
            .await
            .unwrap();
        mgr.onboard_clear().await.unwrap();

        assert!(!store.key_exists(ONBOARD_CERTS_HASH).await);
        assert!(mgr.cache.snapshot().await.onboard_certs.is_empty());
        assert!(mgr.onboard_list().await.unwrap().is_empty());
        // clearing an empty set is not an error
        mgr.onboard_clear().await.unwrap();
    }

    #[tokio::test]
    async fn failed_clear_does_not_shadow_later_registrations() {
        let (store, mgr) = manager();
        mgr.onboard_register(&mint_cert("factory-1"), &serials(&["S1"]))
            .await
            .unwrap();
        store.fail_times("hash_delete", ONBOARD_SERIALS_HASH, 1).await;
        assert!(mgr.onboard_clear().await.is_err());

        let c2 = mint_cert("factory-2");
        mgr.onboard_register(&c2, &serials(&["S1"])).await.unwrap();
        mgr.onboard_check(&c2, "S1").await.unwrap();
        assert_eq!(mgr.onboard_list().await.unwrap(), vec!["factory-2"]);

        // completing the clear later leaves the newer certificate alone
        mgr.recover().await.unwrap();
        assert_eq!(mgr.onboard_list().await.unwrap(), vec!["factory-2"]);
        mgr.onboard_check(&c2, "S1").await.unwrap();
    }

    #[tokio::test]
    async fn reregistering_settles_a_failed_removal() {
        let (store, mgr) = manager();
        let c1 = mint_cert("factory-1");
        mgr.onboard_register(&c1, &serials(&["S1"])).await.unwrap();
        store.fail_times("hash_delete", ONBOARD_CERTS_HASH, 1).await;
        assert!(mgr.onboard_remove("factory-1").await.is_err());
        assert!(mgr.onboard_list().await.unwrap().is_empty());

        mgr.onboard_register(&c1, &serials(&["S2"])).await.unwrap();
        assert!(!store.key_exists(crate::keys::PENDING_OPS_HASH).await);
        mgr.onboard_check(&c1, "S2").await.unwrap();
        assert_eq!(mgr.onboard_get("factory-1").await.unwrap().serials, serials(&["S2"]));
    }

    #[tokio::test]
    async fn certificate_without_common_name_is_rejected() {
        let (_store, mgr) = manager();
        let anonymous = crate::testutil::mint_cert_without_cn();
        assert!(matches!(
            mgr.onboard_register(&anonymous, &serials(&["S1"])).await,
            Err(TrustError::InvalidInput(_))
        ));
    }
}

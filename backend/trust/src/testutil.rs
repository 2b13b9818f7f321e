use std::sync::Arc;
use std::time::Duration;

use keystone_core::Certificate;
use keystone_store::MemoryStore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use crate::manager::{ManagerSettings, TrustManager};

fn self_signed(dn: DistinguishedName) -> Certificate {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name = dn;
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    Certificate::from_der(cert.der().to_vec()).unwrap()
}

/// Fresh self-signed certificate; two calls never yield the same DER.
pub fn mint_cert(cn: &str) -> Certificate {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    self_signed(dn)
}

pub fn mint_cert_without_cn() -> Certificate {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Keystone Test");
    self_signed(dn)
}

pub fn pem_of(cert: &Certificate) -> String {
    cert.to_pem()
}

pub fn serials(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Manager over an in-memory store that refreshes on every call and
/// recovers markers immediately.
pub fn manager() -> (Arc<MemoryStore>, TrustManager) {
    manager_with(ManagerSettings::default())
}

pub fn manager_with(settings: ManagerSettings) -> (Arc<MemoryStore>, TrustManager) {
    let store = Arc::new(MemoryStore::new());
    let settings = ManagerSettings {
        cache_timeout: Duration::ZERO,
        recovery_grace: Duration::ZERO,
        ..settings
    };
    let mgr = TrustManager::new(store.clone(), settings);
    (store, mgr)
}

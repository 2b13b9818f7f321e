//! Certificate codec.
//!
//! Certificates cross the API boundary as parsed [`Certificate`] values and are
//! stored as PEM text. Lookups use the exact DER bytes as identity, never the
//! subject or a fingerprint.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use crate::error::{TrustError, TrustResult};

const PEM_LABEL: &str = "CERTIFICATE";
const PEM_LINE_WIDTH: usize = 64;

/// Raw DER bytes of a certificate, usable as a map key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertIdentity(Arc<[u8]>);

impl fmt::Debug for CertIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertIdentity({} bytes)", self.0.len())
    }
}

/// A parsed X.509 certificate.
#[derive(Clone)]
pub struct Certificate {
    der: Arc<[u8]>,
    common_name: String,
}

impl Certificate {
    /// Parse DER bytes; fails with `Decode` if they are not a certificate.
    pub fn from_der(der: impl Into<Vec<u8>>) -> TrustResult<Self> {
        let der: Vec<u8> = der.into();
        let common_name = {
            let (_, parsed) = X509Certificate::from_der(&der)
                .map_err(|e| TrustError::decode("certificate DER", e))?;
            let cn = parsed
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or("")
                .to_string();
            cn
        };
        Ok(Self {
            der: der.into(),
            common_name,
        })
    }

    /// Parse a single PEM-armoured certificate.
    pub fn from_pem(pem: &[u8]) -> TrustResult<Self> {
        let (_, block) = parse_x509_pem(pem).map_err(|e| TrustError::decode("certificate PEM", e))?;
        if block.label != PEM_LABEL {
            return Err(TrustError::Decode(format!(
                "unexpected PEM block label {}",
                block.label
            )));
        }
        Self::from_der(block.contents)
    }

    /// Encode as PEM text, 64 columns per line.
    pub fn to_pem(&self) -> String {
        let body = STANDARD.encode(&self.der);
        let mut out = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);
        out.push_str("-----BEGIN CERTIFICATE-----\n");
        for chunk in body.as_bytes().chunks(PEM_LINE_WIDTH) {
            // base64 output is ASCII
            out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
            out.push('\n');
        }
        out.push_str("-----END CERTIFICATE-----\n");
        out
    }

    pub fn identity(&self) -> CertIdentity {
        CertIdentity(self.der.clone())
    }

    /// Subject Common Name, empty if the subject carries none.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name)
            .field("der_len", &self.der.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn mint(cn: &str) -> Vec<u8> {
        let mut params = CertificateParams::new(vec![format!("{cn}.local")]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn pem_encoding_survives_storage() {
        let cert = Certificate::from_der(mint("onboard-a")).unwrap();
        let pem = cert.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.lines().all(|l| l.len() <= PEM_LINE_WIDTH));

        let back = Certificate::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(back, cert);
        assert_eq!(back.identity(), cert.identity());
        assert_eq!(back.common_name(), "onboard-a");
    }

    #[test]
    fn identity_is_exact_der() {
        let a = Certificate::from_der(mint("same-cn")).unwrap();
        let b = Certificate::from_der(mint("same-cn")).unwrap();
        assert_eq!(a.common_name(), b.common_name());
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            Certificate::from_der(vec![0x30, 0x03, 0x01]),
            Err(TrustError::Decode(_))
        ));
        assert!(matches!(
            Certificate::from_pem(b"not a pem block"),
            Err(TrustError::Decode(_))
        ));
    }
}

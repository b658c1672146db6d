//! Throwaway PKI for tests. Every helper panics on failure.
//!
//! Enabled for this crate's unit tests and, through the `test-util`
//! feature, for downstream test suites.

use lime_wire::tls::{parse_certs, parse_private_key, thumbprint, TlsMaterial};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;

/// First certificate in a PEM blob.
pub fn der(pem: &str) -> CertificateDer<'static> {
    parse_certs(pem.as_bytes()).unwrap().remove(0)
}

/// A certificate authority with its signing key.
pub struct TestCa {
    pub cert_pem: String,
    pub key: KeyPair,
}

impl TestCa {
    /// Self-signed root.
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            cert_pem: cert.pem(),
            key,
        }
    }

    pub fn intermediate(&self, name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
        let key = KeyPair::generate().unwrap();
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).unwrap();
        let cert = params.signed_by(&key, &issuer).unwrap();
        Self {
            cert_pem: cert.pem(),
            key,
        }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        der(&self.cert_pem)
    }

    /// Leaf for `localhost`, usable as client or server. Returns (cert, key) PEM.
    pub fn issue(&self, name: &str, expired: bool) -> (String, String) {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        if expired {
            params.not_before = rcgen::date_time_ymd(2019, 1, 1);
            params.not_after = rcgen::date_time_ymd(2020, 1, 1);
        }
        let key = KeyPair::generate().unwrap();
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).unwrap();
        let cert = params.signed_by(&key, &issuer).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    /// TLS material for a fresh leaf under this CA, with the root pinned.
    pub fn material(&self, name: &str) -> TlsMaterial {
        let (cert_pem, key_pem) = self.issue(name, false);
        let root = self.der();
        let trusted = thumbprint(&root);
        TlsMaterial::new(
            parse_certs(cert_pem.as_bytes()).unwrap(),
            parse_private_key(key_pem.as_bytes()).unwrap(),
            root,
            Some(&trusted),
        )
        .unwrap()
    }
}

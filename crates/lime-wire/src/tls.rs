//! Mutual TLS: certificate material, chain validation and rustls configs.
//!
//! The mediator builds one [`ServerConfig`] per accepted connection. Its
//! client-certificate verifier is bound to the agent expected at that
//! address, so a certificate that chains correctly but belongs to someone
//! else is rejected inside the TLS handshake, before any session exists.

use crate::error::{WireError, WireResult};
use lime_types::agent::{AgentIdentity, Thumbprint};
use lime_types::config::CertificateSettings;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use zeroize::Zeroizing;

/// SHA-256 thumbprint of a DER certificate.
pub fn thumbprint(der: &[u8]) -> Thumbprint {
    Thumbprint::from_digest(&Sha256::digest(der))
}

/// The crypto provider used for every config built here.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM buffer.
pub fn parse_certs(pem: &[u8]) -> WireResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WireError::Certificate(format!("invalid PEM: {e}")))?;
    if certs.is_empty() {
        return Err(WireError::Certificate("no certificates found".into()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM buffer.
pub fn parse_private_key(pem: &[u8]) -> WireResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| WireError::Certificate(format!("invalid PEM: {e}")))?
        .ok_or_else(|| WireError::Certificate("no private key found".into()))
}

/// Load a PEM certificate file.
pub fn load_certs(path: &Path) -> WireResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| WireError::Certificate(format!("reading {}: {e}", path.display())))?;
    parse_certs(&pem)
}

/// Load a PEM private key file.
pub fn load_private_key(path: &Path) -> WireResult<PrivateKeyDer<'static>> {
    let pem = Zeroizing::new(
        std::fs::read(path)
            .map_err(|e| WireError::Certificate(format!("reading {}: {e}", path.display())))?,
    );
    parse_private_key(&pem)
}

/// Validates a presented chain against the mediator's trust anchor.
pub trait CertificateValidator: Send + Sync + std::fmt::Debug {
    /// `Err` carries a human-readable rejection reason.
    fn validate_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), String>;
}

/// Walks issuer links from the leaf to a root and requires that root to be
/// the configured trust anchor. Every certificate on the path must be inside
/// its validity window.
#[derive(Debug, Clone)]
pub struct RootThumbprintValidator {
    root: CertificateDer<'static>,
    trusted: Thumbprint,
}

impl RootThumbprintValidator {
    /// Fails if `root` does not hash to `trusted`.
    pub fn new(root: CertificateDer<'static>, trusted: Thumbprint) -> WireResult<Self> {
        let actual = thumbprint(&root);
        if actual != trusted {
            return Err(WireError::Certificate(format!(
                "root certificate thumbprint {actual} does not match trusted thumbprint {trusted}"
            )));
        }
        Ok(Self { root, trusted })
    }

    pub fn trusted(&self) -> &Thumbprint {
        &self.trusted
    }
}

fn parse_x509(der: &[u8]) -> Result<X509Certificate<'_>, String> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| format!("unparsable certificate: {e}"))
}

fn check_validity(cert: &X509Certificate<'_>) -> Result<(), String> {
    if cert.validity().is_valid() {
        Ok(())
    } else {
        Err(format!(
            "certificate '{}' is outside its validity period",
            cert.subject()
        ))
    }
}

impl CertificateValidator for RootThumbprintValidator {
    fn validate_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), String> {
        let anchor = parse_x509(&self.root)?;
        check_validity(&anchor)?;

        // Index 0 is the leaf; the rest are candidates for issuers.
        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push((end_entity.as_ref(), parse_x509(end_entity)?));
        for der in intermediates {
            chain.push((der.as_ref(), parse_x509(der)?));
        }

        let mut current = 0;
        for _ in 0..chain.len() {
            let (der, cert) = &chain[current];
            check_validity(cert)?;

            if cert.issuer().as_raw() == anchor.subject().as_raw() {
                return Ok(());
            }
            if cert.issuer().as_raw() == cert.subject().as_raw() {
                let presented = thumbprint(der);
                return if presented == self.trusted {
                    Ok(())
                } else {
                    Err(format!("chain ends at untrusted root {presented}"))
                };
            }

            current = chain
                .iter()
                .position(|(_, c)| c.subject().as_raw() == cert.issuer().as_raw())
                .ok_or_else(|| format!("no issuer found for '{}'", cert.subject()))?;
        }
        Err("certificate chain is cyclic".into())
    }
}

/// Client-certificate verifier bound to one expected agent.
///
/// Signature and path checks are delegated to rustls' webpki verifier; on
/// top of that the chain must satisfy the [`CertificateValidator`] and the
/// leaf must carry the agent's registered thumbprint.
#[derive(Debug)]
pub struct AgentCertVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    validator: Arc<dyn CertificateValidator>,
    agent: AgentIdentity,
}

impl AgentCertVerifier {
    pub fn new(
        inner: Arc<dyn ClientCertVerifier>,
        validator: Arc<dyn CertificateValidator>,
        agent: AgentIdentity,
    ) -> Self {
        Self {
            inner,
            validator,
            agent,
        }
    }

    fn reject(&self, reason: &str) -> rustls::Error {
        warn!(agent = %self.agent.id, name = %self.agent.name, reason, "Client certificate rejected");
        rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
    }
}

impl ClientCertVerifier for AgentCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.inner
            .verify_client_cert(end_entity, intermediates, now)
            .map_err(|e| {
                warn!(agent = %self.agent.id, error = %e, "Client certificate failed path validation");
                e
            })?;

        self.validator
            .validate_chain(end_entity, intermediates)
            .map_err(|reason| self.reject(&reason))?;

        let presented = thumbprint(end_entity);
        if presented != self.agent.thumbprint {
            return Err(self.reject(&format!(
                "thumbprint {presented} does not match registered {}",
                self.agent.thumbprint
            )));
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A certificate chain, its key and the root it trusts.
///
/// The same shape serves both ends: the mediator's server identity, and an
/// agent's client identity.
pub struct TlsMaterial {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    root: CertificateDer<'static>,
    roots: Arc<RootCertStore>,
    root_thumbprint: Thumbprint,
    client_verifier: Arc<dyn ClientCertVerifier>,
    provider: Arc<CryptoProvider>,
}

impl TlsMaterial {
    /// Assemble material from parsed parts. When `trusted_root` is given, the
    /// root certificate must hash to it.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        root: CertificateDer<'static>,
        trusted_root: Option<&Thumbprint>,
    ) -> WireResult<Self> {
        if cert_chain.is_empty() {
            return Err(WireError::Certificate("empty certificate chain".into()));
        }
        let root_thumbprint = thumbprint(&root);
        if let Some(expected) = trusted_root {
            if *expected != root_thumbprint {
                return Err(WireError::Certificate(format!(
                    "root certificate thumbprint {root_thumbprint} does not match trusted thumbprint {expected}"
                )));
            }
        }

        let mut store = RootCertStore::empty();
        store
            .add(root.clone())
            .map_err(|e| WireError::Certificate(format!("unusable root certificate: {e}")))?;
        let roots = Arc::new(store);
        let provider = crypto_provider();
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&provider))
                .build()
                .map_err(|e| WireError::Tls(e.to_string()))?;

        Ok(Self {
            cert_chain,
            key,
            root,
            roots,
            root_thumbprint,
            client_verifier,
            provider,
        })
    }

    /// Load the mediator's material from configured paths.
    pub fn load(settings: &CertificateSettings) -> WireResult<Self> {
        let cert_chain = load_certs(&settings.server_cert)?;
        let key = load_private_key(&settings.server_key)?;
        let root = load_certs(&settings.root_cert)?
            .into_iter()
            .next()
            .ok_or_else(|| WireError::Certificate("no root certificate".into()))?;
        Self::new(
            cert_chain,
            key,
            root,
            settings.trusted_root_thumbprint.as_ref(),
        )
    }

    /// Thumbprint of the trust anchor.
    pub fn root_thumbprint(&self) -> &Thumbprint {
        &self.root_thumbprint
    }

    /// Thumbprint of our own leaf certificate.
    pub fn leaf_thumbprint(&self) -> Thumbprint {
        thumbprint(&self.cert_chain[0])
    }

    /// The default chain validator for this trust anchor.
    pub fn root_validator(&self) -> RootThumbprintValidator {
        RootThumbprintValidator {
            root: self.root.clone(),
            trusted: self.root_thumbprint.clone(),
        }
    }

    /// TLS 1.3 server config that only accepts `agent`'s certificate.
    pub fn server_config(
        &self,
        agent: &AgentIdentity,
        validator: Arc<dyn CertificateValidator>,
    ) -> WireResult<Arc<ServerConfig>> {
        let verifier = Arc::new(AgentCertVerifier::new(
            Arc::clone(&self.client_verifier),
            validator,
            agent.clone(),
        ));
        let config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| WireError::Tls(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| WireError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }

    /// TLS 1.3 client config presenting our certificate (agent side).
    pub fn client_config(&self) -> WireResult<Arc<ClientConfig>> {
        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| WireError::Tls(e.to_string()))?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| WireError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("chain_len", &self.cert_chain.len())
            .field("root_thumbprint", &self.root_thumbprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{der, TestCa};
    use lime_types::agent::AgentId;

    fn validator_for(ca: &TestCa) -> RootThumbprintValidator {
        let root = ca.der();
        let tp = thumbprint(&root);
        RootThumbprintValidator::new(root, tp).unwrap()
    }

    #[test]
    fn test_thumbprint_is_uppercase_sha256() {
        let tp = thumbprint(b"abc");
        assert_eq!(
            tp.as_str(),
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_certs(b"not pem").is_err());
        assert!(parse_private_key(b"").is_err());
    }

    #[test]
    fn test_validator_rejects_wrong_trusted_thumbprint() {
        let root = TestCa::new("root");
        let err = RootThumbprintValidator::new(root.der(), Thumbprint::parse("AA").unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_chain_to_trusted_root() {
        let root = TestCa::new("root");
        let (leaf_pem, _) = root.issue("agent", false);
        let validator = validator_for(&root);
        assert!(validator.validate_chain(&der(&leaf_pem), &[]).is_ok());
        // A chain that includes the root itself is accepted too.
        assert!(validator
            .validate_chain(&der(&leaf_pem), &[root.der()])
            .is_ok());
    }

    #[test]
    fn test_chain_through_intermediate() {
        let root = TestCa::new("root");
        let intermediate = root.intermediate("intermediate");
        let validator = validator_for(&root);

        let (leaf_pem, _) = intermediate.issue("agent", false);
        assert!(validator
            .validate_chain(&der(&leaf_pem), &[intermediate.der()])
            .is_ok());
        // Without the intermediate the path cannot be built.
        assert!(validator.validate_chain(&der(&leaf_pem), &[]).is_err());
    }

    #[test]
    fn test_chain_to_foreign_root_rejected() {
        let trusted = TestCa::new("trusted");
        let foreign = TestCa::new("foreign");
        let validator = validator_for(&trusted);
        let (leaf_pem, _) = foreign.issue("agent", false);
        let err = validator
            .validate_chain(&der(&leaf_pem), &[foreign.der()])
            .unwrap_err();
        assert!(err.contains("untrusted root"));
    }

    #[test]
    fn test_expired_leaf_rejected() {
        let root = TestCa::new("root");
        let validator = validator_for(&root);
        let (leaf_pem, _) = root.issue("agent", true);
        let err = validator.validate_chain(&der(&leaf_pem), &[]).unwrap_err();
        assert!(err.contains("validity"));
    }

    #[test]
    fn test_material_checks_trusted_root() {
        let root = TestCa::new("root");
        let (leaf_pem, key_pem) = root.issue("mediator", false);
        let chain = parse_certs(leaf_pem.as_bytes()).unwrap();
        let key = parse_private_key(key_pem.as_bytes()).unwrap();
        let root_der = root.der();

        let wrong = Thumbprint::parse("00").unwrap();
        assert!(
            TlsMaterial::new(chain.clone(), key.clone_key(), root_der.clone(), Some(&wrong)).is_err()
        );

        let material = TlsMaterial::new(chain, key, root_der.clone(), None).unwrap();
        assert_eq!(material.root_thumbprint(), &thumbprint(&root_der));
        assert_eq!(material.leaf_thumbprint(), thumbprint(&der(&leaf_pem)));

        let agent = AgentIdentity {
            id: AgentId::new(),
            name: "a".into(),
            thumbprint: material.leaf_thumbprint(),
        };
        assert!(material
            .server_config(&agent, Arc::new(material.root_validator()))
            .is_ok());
        assert!(material.client_config().is_ok());
    }

    #[test]
    fn test_load_from_files() {
        let root = TestCa::new("root");
        let (leaf_pem, key_pem) = root.issue("mediator", false);
        let dir = tempfile::tempdir().unwrap();
        let settings = CertificateSettings {
            server_cert: dir.path().join("mediator.pem"),
            server_key: dir.path().join("mediator.key"),
            root_cert: dir.path().join("root.pem"),
            trusted_root_thumbprint: Some(thumbprint(&root.der())),
        };
        std::fs::write(&settings.server_cert, leaf_pem).unwrap();
        std::fs::write(&settings.server_key, key_pem).unwrap();
        std::fs::write(&settings.root_cert, &root.cert_pem).unwrap();

        let material = TlsMaterial::load(&settings).unwrap();
        assert_eq!(
            Some(material.root_thumbprint()),
            settings.trusted_root_thumbprint.as_ref()
        );

        let missing = CertificateSettings {
            server_cert: dir.path().join("absent.pem"),
            ..settings
        };
        assert!(TlsMaterial::load(&missing).is_err());
    }
}

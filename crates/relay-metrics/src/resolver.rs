//! Rotating server-certificate resolver.
//!
//! TLS handshakes read the newest certificate from a lock-protected
//! slot; a background reader overwrites the slot on every renewal the
//! Vault client emits. Connections already established keep their
//! certificate, new handshakes pick up the fresh one.

use std::sync::{Arc, RwLock};

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;

use relay_vault::CertificateLease;

use crate::MetricsError;

#[derive(Default)]
pub(crate) struct RotatingCertResolver {
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for RotatingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingCertResolver")
            .field("loaded", &self.current.read().unwrap().is_some())
            .finish()
    }
}

impl RotatingCertResolver {
    /// Parse a lease and make it the certificate for new handshakes.
    pub(crate) fn install(&self, lease: &CertificateLease) -> Result<(), MetricsError> {
        let key = certified_key(lease)?;
        *self.current.write().unwrap() = Some(Arc::new(key));
        Ok(())
    }
}

impl ResolvesServerCert for RotatingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.read().unwrap().clone()
    }
}

/// Convert a PEM lease into rustls signing material.
pub(crate) fn certified_key(lease: &CertificateLease) -> Result<CertifiedKey, MetricsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut lease.cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| MetricsError::Certificate(format!("invalid certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(MetricsError::Certificate(
            "certificate PEM contains no certificates".into(),
        ));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut lease.key_pem.as_bytes())
        .map_err(|e| MetricsError::Certificate(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| MetricsError::Certificate("key PEM contains no private key".into()))?;

    let signing_key = ring::sign::any_supported_type(&key)
        .map_err(|e| MetricsError::Certificate(format!("unsupported private key: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Build the client-CA pool used to verify scraper certificates.
pub(crate) fn client_ca_roots(pem: &[u8]) -> Result<RootCertStore, MetricsError> {
    let mut roots = RootCertStore::empty();

    for cert in rustls_pemfile::certs(&mut &*pem) {
        let cert =
            cert.map_err(|e| MetricsError::Certificate(format!("invalid client CA PEM: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| MetricsError::Certificate(format!("rejected client CA: {e}")))?;
    }

    if roots.is_empty() {
        return Err(MetricsError::Certificate(
            "client CA bundle contains no certificates".into(),
        ));
    }

    Ok(roots)
}

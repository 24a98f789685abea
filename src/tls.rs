//! TLS material for STARTTLS upgrades.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore,
};
use tokio_rustls::TlsAcceptor;

use crate::error::Error;

/// A configured TLS acceptor plus the policy facts the session needs.
#[derive(Clone)]
pub struct TlsSettings {
    pub(crate) acceptor: TlsAcceptor,
    pub(crate) require_client_auth: bool,
}

impl TlsSettings {
    /// Wrap an existing acceptor that does not request client certificates.
    pub fn new(acceptor: TlsAcceptor) -> Self {
        Self { acceptor, require_client_auth: false }
    }

    /// Wrap an existing acceptor whose verifier requires client
    /// certificates; the peer chain is captured after each handshake.
    pub fn with_client_auth(acceptor: TlsAcceptor) -> Self {
        Self { acceptor, require_client_auth: true }
    }

    /// Load a PEM certificate chain and private key, no client authentication.
    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self, Error> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(load_certs(cert_path)?, load_key(key_path)?)
            .map_err(|e| Error::Tls(format!("invalid certificate/key: {}", e)))?;
        Ok(Self::new(TlsAcceptor::from(Arc::new(config))))
    }

    /// Like [`from_pem_files`], but requires client certificates verified
    /// against the given CA bundle.
    ///
    /// [`from_pem_files`]: TlsSettings::from_pem_files
    pub fn from_pem_files_with_client_auth(
        cert_path: &str,
        key_path: &str,
        client_ca_path: &str,
    ) -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(client_ca_path)? {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("invalid client CA certificate: {}", e)))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Tls(format!("client verifier: {}", e)))?;
        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(load_certs(cert_path)?, load_key(key_path)?)
            .map_err(|e| Error::Tls(format!("invalid certificate/key: {}", e)))?;
        Ok(Self::with_client_auth(TlsAcceptor::from(Arc::new(config))))
    }
}

/// Ensure rustls has an active crypto provider (required by rustls 0.23+).
/// Ignores the error when one is already installed.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid certificate in {}: {}", path, e)))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::Tls(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| Error::Tls(format!("invalid key in {}: {}", path, e)))?;
        match item {
            rustls_pemfile::Item::Pkcs1Key(k) => return Ok(PrivateKeyDer::Pkcs1(k)),
            rustls_pemfile::Item::Pkcs8Key(k) => return Ok(PrivateKeyDer::Pkcs8(k)),
            rustls_pemfile::Item::Sec1Key(k) => return Ok(PrivateKeyDer::Sec1(k)),
            _ => {}
        }
    }
    Err(Error::Tls(format!("no private key found in {}", path)))
}

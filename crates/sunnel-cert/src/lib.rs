//! Certificate handling for the sunnel listeners
//!
//! Loads PEM-encoded TLS identities from disk, generates ephemeral self-signed
//! certificates, and turns either into a `tokio_rustls::TlsAcceptor`.

pub mod identity;
pub mod self_signed;

pub use identity::{load_certs, load_private_key, CertError, TlsIdentityConfig};
pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_with_domains, SelfSignedCertificate,
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Certificate with private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Build a server-side acceptor presenting this certificate
    pub fn into_acceptor(self) -> Result<TlsAcceptor, CertError> {
        ensure_crypto_provider();

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain, self.private_key)?;

        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider as the process default (once)
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

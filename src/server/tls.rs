//! TLS termination with the materialized identity.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS crypto provider unavailable: {0}")]
    CryptoProvider(#[source] rustls::Error),
    #[error("failed to load {}: {source}", .path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::Error,
    },
    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),
    #[error("certificate and key rejected: {0}")]
    Config(#[source] rustls::Error),
}

impl TlsError {
    /// Whether this error means the cryptographic backend itself is unusable.
    pub fn is_fatal_environment(&self) -> bool {
        matches!(self, Self::CryptoProvider(_))
    }
}

/// TLS acceptor serving a single certificate chain.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Loads the PEM certificate and key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let config = Self::create_config(cert_path, key_path)?;
        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
        })
    }

    /// Creates a rustls ServerConfig advertising HTTP/2 and HTTP/1.1.
    fn create_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
        let pem_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source: pem::Error| TlsError::Pem { path, source }
        };

        let certs = CertificateDer::pem_file_iter(cert_path)
            .map_err(pem_error(cert_path))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(pem_error(cert_path))?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
        }
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(pem_error(key_path))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TlsError::CryptoProvider)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::Config)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    /// Accepts a TLS connection, performing the handshake.
    pub async fn accept(&self, stream: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let tls_stream = self.inner.accept(stream).await?;

        let alpn = tls_stream
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        debug!("TLS handshake completed, ALPN: {:?}", alpn);

        Ok(tls_stream)
    }
}

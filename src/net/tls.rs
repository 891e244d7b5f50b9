//! TLS configuration and per-connection handshakes.

use std::path::Path;

use axum_server::accept::{Accept, DefaultAcceptor};
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Load a PEM certificate chain and private key.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    for (what, path) in [("Certificate", cert_path), ("Private key", key_path)] {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{what} file not found: {}", path.display()),
            ));
        }
    }
    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Performs the server side of the TLS handshake for accepted sockets.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: RustlsAcceptor<DefaultAcceptor>,
}

impl TlsAcceptor {
    /// Acceptor presenting the certificate in `config`.
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }

    /// Run the handshake; the acceptor is consumed, clone it per connection.
    pub async fn accept(
        self,
        stream: TcpStream,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static, std::io::Error> {
        let (stream, ()) = self.inner.accept(stream, ()).await?;
        Ok(stream)
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor").finish_non_exhaustive()
    }
}

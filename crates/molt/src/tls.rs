//! TLS wrapper listener.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::listener::Listener;

/// A listener that performs a TLS handshake on every accepted connection.
///
/// Its descriptor is the inner listener's; registering a `TlsListener` hands
/// off the plain socket and the successor wraps it again with its own
/// (possibly reloaded) certificates.
pub struct TlsListener<L> {
    inner: L,
    acceptor: TlsAcceptor,
}

impl<L: Listener> TlsListener<L> {
    /// Wrap `inner` with `acceptor`.
    pub fn new(inner: L, acceptor: TlsAcceptor) -> Self {
        Self { inner, acceptor }
    }

    /// The wrapped listener.
    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    /// The acceptor used for handshakes.
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// Unwrap into the plain listener.
    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl TlsListener<tokio::net::TcpListener> {
    /// Accept a connection and complete the TLS handshake.
    pub async fn accept(&self) -> io::Result<(TlsStream<TcpStream>, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        let tls = self.acceptor.accept(stream).await?;
        debug!(peer_addr = %peer, "TLS handshake complete");
        Ok((tls, peer))
    }
}

impl<L: Listener> Listener for TlsListener<L> {
    fn inner(&self) -> Option<&dyn Listener> {
        Some(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::sync::Arc;

    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;

    use crate::listener::extract;
    use crate::registry::Registry;

    fn test_acceptor() -> TlsAcceptor {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()])
                .expect("Failed to generate test certificate");
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("Failed to select protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .expect("Failed to create server config");

        TlsAcceptor::from(Arc::new(config))
    }

    #[tokio::test]
    async fn test_tls_listener_exposes_inner_descriptor() {
        let inner = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fd = inner.as_raw_fd();
        let addr = inner.local_addr().unwrap();
        let listener = TlsListener::new(inner, test_acceptor());

        assert_eq!(extract(&listener).unwrap(), fd);
        assert_eq!(listener.label().unwrap(), format!("tcp:{addr}"));
    }

    #[tokio::test]
    async fn test_tls_listener_registers_plain_socket() {
        let inner = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fd = inner.as_raw_fd();
        let registry = Registry::new();

        registry
            .put("https", Arc::new(TlsListener::new(inner, test_acceptor())))
            .unwrap();

        let service = registry.get("https").unwrap();
        assert_eq!(service.descriptor(), fd);
        assert!(service.label().starts_with("tcp:127.0.0.1:"));
        assert!(registry
            .listener::<TlsListener<tokio::net::TcpListener>>("https")
            .is_some());
    }
}

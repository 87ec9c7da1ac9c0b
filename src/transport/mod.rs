//! TLS transport for broker tunnels
//!
//! Tunnels are mutually authenticated: both sides present certificates
//! issued by the configured CA, and the peer identity is the certificate
//! Common Name (expected to be the peer's endpoint FQDN). The broker can
//! also run without TLS for loopback wiring and tests; identity-gated
//! features stay off in that mode.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use x509_parser::prelude::*;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("TLS authentication failure: {0}")]
    TlsAuth(String),

    #[error("invalid certificate in {0}")]
    InvalidCertificate(String),

    #[error("timeout during {0}")]
    Timeout(&'static str),
}

/// The authenticated identity of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Certificate Common Name, the peer's endpoint FQDN
    pub common_name: String,
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| TransportError::Tls(format!("cannot parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::InvalidCertificate(
            path.display().to_string(),
        ));
    }
    Ok(certs)
}

/// Load a PEM private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Tls(format!("cannot parse {}: {}", path.display(), e)))?
        .ok_or_else(|| TransportError::InvalidCertificate(path.display().to_string()))
}

/// The mutual-TLS dial and accept context shared by the mux.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

impl TlsContext {
    /// Build connector and acceptor from PEM files: own certificate and
    /// key, plus the CA bundle peers must be issued by.
    pub fn from_files(
        cert_file: &Path,
        key_file: &Path,
        ca_file: &Path,
    ) -> Result<Self, TransportError> {
        let certs = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;
        let ca_certs = load_certs(ca_file)?;

        let mut roots = RootCertStore::empty();
        for ca in ca_certs {
            roots
                .add(ca)
                .map_err(|e| TransportError::Tls(format!("bad CA certificate: {}", e)))?;
        }
        let roots = Arc::new(roots);

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .map_err(|e| TransportError::Tls(format!("client config: {}", e)))?;

        let verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| TransportError::Tls(format!("client verifier: {}", e)))?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(format!("server config: {}", e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Dial a peer endpoint. TCP connect and TLS handshake each get the
    /// budget as their own deadline.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        budget: Duration,
    ) -> Result<client::TlsStream<TcpStream>, TransportError> {
        let tcp = dial_tcp(host, port, budget).await?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {:?}: {}", host, e)))?;
        tokio::time::timeout(budget, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Timeout("tls handshake"))?
            .map_err(|e| TransportError::TlsAuth(e.to_string()))
    }

    /// Accept one TLS server connection and extract the peer identity.
    pub async fn accept(
        &self,
        stream: TcpStream,
        budget: Duration,
    ) -> Result<(server::TlsStream<TcpStream>, Option<PeerIdentity>), TransportError> {
        let tls = tokio::time::timeout(budget, self.acceptor.accept(stream))
            .await
            .map_err(|_| TransportError::Timeout("tls handshake"))?
            .map_err(|e| TransportError::TlsAuth(e.to_string()))?;

        let identity = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(peer_common_name)
            .map(|common_name| PeerIdentity { common_name });
        Ok((tls, identity))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// Plain TCP dial with its own deadline; nodelay keeps small control
/// frames from stalling behind Nagle.
pub async fn dial_tcp(host: &str, port: u16, budget: Duration) -> Result<TcpStream, TransportError> {
    let addr = format!("{}:{}", host, port);
    let tcp = tokio::time::timeout(budget, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::Timeout("dial"))?
        .map_err(TransportError::Io)?;
    tcp.set_nodelay(true).ok();
    Ok(tcp)
}

/// Common Name of the leaf certificate.
fn peer_common_name(certs: &[CertificateDer<'_>]) -> Option<String> {
    let leaf = certs.first()?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

/// The address a listener should bind for a broker port.
pub fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr(8088).to_string(), "0.0.0.0:8088");
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        // RFC 5737 TEST-NET-1 is unroutable; the dial must hit the budget
        let err = dial_tcp("192.0.2.1", 9, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            TransportError::Timeout("dial") | TransportError::Io(_) => {}
            other => panic!("expected dial timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }
}

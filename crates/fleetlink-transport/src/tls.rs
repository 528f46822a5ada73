//! TLS listener and connector for the control channel

use crate::{FramedControlStream, TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Server-side control stream (TLS over TCP)
pub type ServerControlStream = FramedControlStream<tokio_rustls::server::TlsStream<TcpStream>>;

/// Client-side control stream (TLS over TCP)
pub type ClientControlStream = FramedControlStream<tokio_rustls::client::TlsStream<TcpStream>>;

/// Server TLS configuration: paths to a PEM certificate chain and key
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsServerConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    fn build_acceptor(&self) -> TransportResult<TlsAcceptor> {
        ensure_crypto_provider();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

/// Client TLS configuration
///
/// Verification uses the CA bundle at `ca_cert_path` when given, the system
/// webpki roots otherwise. `insecure()` disables verification entirely for
/// local development against self-signed deployments.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    /// Name presented for SNI and certificate validation
    pub server_name: String,
    pub ca_cert_path: Option<PathBuf>,
    pub verify_server_cert: bool,
}

impl TlsClientConfig {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ca_cert_path: None,
            verify_server_cert: true,
        }
    }

    /// Trust a custom CA bundle instead of the webpki roots
    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn insecure(server_name: impl Into<String>) -> Self {
        let mut config = Self::new(server_name);
        config.verify_server_cert = false;
        config
    }

    fn build_connector(&self) -> TransportResult<TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        match &self.ca_cert_path {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let client_crypto = if self.verify_server_cert {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(TlsConnector::from(Arc::new(client_crypto)))
    }
}

/// TCP listener that performs a TLS handshake and frames control messages
pub struct TlsControlListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsControlListener {
    pub async fn bind(addr: SocketAddr, config: &TlsServerConfig) -> TransportResult<Self> {
        let acceptor = config.build_acceptor()?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and complete the TLS handshake
    pub async fn accept(&self) -> TransportResult<ServerControlStream> {
        let (tcp, peer_addr) = self.listener.accept().await?;
        let tls = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| TransportError::TlsError(format!("Handshake failed: {}", e)))?;

        debug!("Accepted control connection from {}", peer_addr);
        Ok(FramedControlStream::new(tls, Some(peer_addr)))
    }
}

/// Connect to a control server at `addr` ("host:port")
pub async fn connect(addr: &str, config: &TlsClientConfig) -> TransportResult<ClientControlStream> {
    let connector = config.build_connector()?;

    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionError(format!("Connect to {} failed: {}", addr, e)))?;
    let peer_addr = tcp.peer_addr().ok();

    let server_name = rustls::pki_types::ServerName::try_from(config.server_name.clone())
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid server name: {}", e)))?;

    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::TlsError(format!("Handshake failed: {}", e)))?;

    debug!("Connected to control server at {}", addr);
    Ok(FramedControlStream::new(tls, peer_addr))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

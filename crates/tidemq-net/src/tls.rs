//! TLS configuration and the non-blocking TLS stream.
//!
//! [`TlsStream`] layers a rustls connection over a mio stream. Nothing in it
//! blocks: the handshake is stepped whenever the socket is ready and reports
//! whether it wants to read or write next, and record I/O reports
//! `WouldBlock` like the raw stream does.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use mio::net::TcpStream;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::{NetError, Result};

/// Client side TLS settings.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM file with CA certificates; the bundled web PKI roots when absent.
    pub ca_cert: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Name to verify the server certificate against instead of the host.
    pub server_name: Option<String>,
    /// Accept any server certificate. Testing only.
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    /// Validate the TLS configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err("client_cert and client_key must be given together".into());
        }
        Ok(())
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| NetError::Tls(format!("Failed to open certificate {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NetError::Tls(format!("Failed to parse certificate {:?}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(NetError::Tls(format!("No certificates found in {:?}", path)));
    }
    Ok(certs)
}

/// Load the first PEM private key in a file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| NetError::Tls(format!("Failed to open key {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| NetError::Tls(format!("Failed to parse key {:?}: {}", path, e)))?
        .ok_or_else(|| NetError::Tls(format!("No private key found in {:?}", path)))
}

/// Build a rustls ClientConfig from our TlsConfig.
pub fn build_client_config(config: &TlsConfig) -> Result<ClientConfig> {
    if config.accept_invalid_certs {
        return build_insecure_config();
    }

    let roots = match &config.ca_cert {
        Some(path) => load_certs(path)?,
        None => Vec::new(),
    };

    let identity = match (&config.client_cert, &config.client_key) {
        (Some(cert), Some(key)) => Some((load_certs(cert)?, load_private_key(key)?)),
        _ => None,
    };

    client_config_with_roots(roots, identity)
}

/// Client config trusting `roots`, or the web PKI roots when `roots` is empty.
pub fn client_config_with_roots(
    roots: Vec<CertificateDer<'static>>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    if roots.is_empty() {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for cert in roots {
            root_store
                .add(cert)
                .map_err(|e| NetError::Tls(format!("Failed to add CA cert: {}", e)))?;
        }
    }

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Tls(e.to_string()))?
        .with_root_certificates(root_store);

    match identity {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| NetError::Tls(format!("Failed to configure client auth: {}", e))),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Server config from PEM certificate chain and key files.
pub fn build_server_config(cert: &Path, key: &Path) -> Result<ServerConfig> {
    let config = server_config_with_identity(load_certs(cert)?, load_private_key(key)?)?;
    debug!("TLS configuration loaded from {:?}", cert);
    Ok(config)
}

pub fn server_config_with_identity(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::Tls(format!("Failed to build TLS config: {}", e)))
}

/// Danger: A certificate verifier that accepts any certificate.
mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoCertificateVerification(pub Arc<CryptoProvider>);

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

/// Build an insecure TLS config that accepts any certificate.
pub fn build_insecure_config() -> Result<ClientConfig> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification(provider)))
        .with_no_client_auth();
    Ok(config)
}

/// Role a socket takes in the TLS handshake.
#[derive(Clone)]
pub enum TlsSetup {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server(Arc<ServerConfig>),
}

impl TlsSetup {
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| NetError::Tls(format!("Invalid server name: {}", server_name)))?;
        Ok(TlsSetup::Client {
            config,
            server_name,
        })
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        TlsSetup::Server(config)
    }

    pub(crate) fn connection(&self) -> Result<Connection> {
        match self {
            TlsSetup::Client {
                config,
                server_name,
            } => ClientConnection::new(Arc::clone(config), server_name.clone())
                .map(Connection::from)
                .map_err(|e| NetError::Tls(e.to_string())),
            TlsSetup::Server(config) => ServerConnection::new(Arc::clone(config))
                .map(Connection::from)
                .map_err(|e| NetError::Tls(e.to_string())),
        }
    }
}

impl std::fmt::Debug for TlsSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsSetup::Client { server_name, .. } => {
                f.debug_struct("Client").field("server_name", server_name).finish()
            }
            TlsSetup::Server(_) => f.write_str("Server"),
        }
    }
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    WantRead,
    WantWrite,
}

/// A rustls connection over a non-blocking stream.
pub struct TlsStream {
    conn: Connection,
    stream: TcpStream,
}

impl TlsStream {
    pub fn new(conn: Connection, stream: TcpStream) -> Self {
        Self { conn, stream }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Encrypted records are waiting to be written.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Advance the handshake as far as the stream allows.
    ///
    /// `WantRead` and `WantWrite` are not errors; the step is repeated when
    /// the stream is next ready.
    pub fn handshake(&mut self) -> io::Result<HandshakeStatus> {
        loop {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut self.stream) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::WantWrite)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            if !self.conn.is_handshaking() {
                return Ok(HandshakeStatus::Complete);
            }

            match self.conn.read_tls(&mut self.stream) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    ))
                }
                Ok(_) => self.process_new_packets()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeStatus::WantRead)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn process_new_packets(&mut self) -> io::Result<()> {
        if let Err(e) = self.conn.process_new_packets() {
            // Best effort to get the alert out before failing
            let _ = self.conn.write_tls(&mut self.stream);
            return Err(io::Error::new(io::ErrorKind::InvalidData, e));
        }
        Ok(())
    }

    /// Write pending encrypted records until done or the stream blocks.
    pub fn flush_records(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Decrypt into `buf`, pulling records from the stream as needed.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            match self.conn.read_tls(&mut self.stream) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.process_new_packets()?;
                    if self.conn.wants_write() {
                        match self.flush_records() {
                            Err(e) if e.kind() != io::ErrorKind::WouldBlock => return Err(e),
                            _ => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Encrypt `buf`. Refuses new data while earlier records are still stuck.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_records()?;
        let n = self.conn.writer().write(buf)?;
        match self.flush_records() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(n),
        }
    }

    /// Queue a close_notify alert and try to write it.
    pub fn close(&mut self) {
        self.conn.send_close_notify();
        let _ = self.flush_records();
    }
}

//! Mutual-TLS plumbing: context construction, handshakes, and peer
//! identity extraction.
//!
//! A [`TlsContext`] bundles the server and client sides of one identity:
//! the same certificate chain and key are presented when accepting and
//! when dialing, and the same trust roots verify the peer in both
//! directions. Peer identity is the common name of the peer certificate;
//! a connection without a verifiable CN is rejected.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::error::{FabricError, FabricResult};

/// Maximum time a TLS handshake may take before the connection is dropped.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Install the ring crypto provider as the process default.
///
/// Safe to call more than once; later calls are no-ops.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// TLS context shared by listeners and dialers.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    /// Build a context from in-memory DER material.
    ///
    /// `chain` and `key` are this manager's own credentials; `roots` are
    /// the CA certificates trusted to sign peer certificates.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        roots: Vec<CertificateDer<'static>>,
    ) -> FabricResult<Self> {
        install_crypto_provider();

        let mut root_store = RootCertStore::empty();
        for root in roots {
            root_store.add(root)?;
        }
        let root_store = Arc::new(root_store);

        let client_verifier = WebPkiClientVerifier::builder(root_store.clone())
            .build()
            .map_err(|e| FabricError::Config(format!("Invalid client verifier roots: {e}")))?;

        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain.clone(), key.clone_key())?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_client_auth_cert(chain, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Build a context from PEM files.
    pub fn from_pem_files(
        cert_file: &Path,
        key_file: &Path,
        ca_file: &Path,
    ) -> FabricResult<Self> {
        let chain = read_cert_chain(cert_file)?;
        let key = read_private_key(key_file)?;
        let roots = read_cert_chain(ca_file)?;
        Self::from_der(chain, key, roots)
    }

    /// Server-side handshake on an accepted socket.
    pub async fn accept(&self, socket: TcpStream) -> FabricResult<TlsStream<TcpStream>> {
        let stream = timeout(TLS_HANDSHAKE_TIMEOUT, self.acceptor.accept(socket))
            .await
            .map_err(|_| FabricError::Connection("TLS handshake timed out".into()))?
            .map_err(|e| FabricError::Connection(format!("TLS handshake failed: {e}")))?;
        Ok(TlsStream::Server(stream))
    }

    /// Client-side handshake on a dialed socket.
    ///
    /// `server_name` is the dialed host; the peer certificate must be
    /// valid for it.
    pub async fn connect(
        &self,
        server_name: &str,
        socket: TcpStream,
    ) -> FabricResult<TlsStream<TcpStream>> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| FabricError::Connection(format!("Invalid server name: {e}")))?;
        let stream = timeout(TLS_HANDSHAKE_TIMEOUT, self.connector.connect(name, socket))
            .await
            .map_err(|_| FabricError::Connection("TLS handshake timed out".into()))?
            .map_err(|e| FabricError::Connection(format!("TLS handshake failed: {e}")))?;
        Ok(TlsStream::Client(stream))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// Extract the peer certificate's common name from a completed handshake.
///
/// Returns `None` if the peer presented no certificate or the certificate
/// carries no readable CN.
pub fn peer_identity(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_, session) = stream.get_ref();
    let cert = session.peer_certificates()?.first()?;
    extract_common_name(cert)
}

fn extract_common_name(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);
    name
}

fn read_cert_chain(path: &Path) -> FabricResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| FabricError::Config(format!("Cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FabricError::Config(format!("Bad certificate in {}: {e}", path.display())))?;
    if chain.is_empty() {
        return Err(FabricError::Config(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn read_private_key(path: &Path) -> FabricResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| FabricError::Config(format!("Cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| FabricError::Config(format!("Bad private key in {}: {e}", path.display())))?
        .ok_or_else(|| {
            FabricError::Config(format!("No private key found in {}", path.display()))
        })
}

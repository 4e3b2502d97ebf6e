//! QUIC transport backed by `quinn` and `rustls`.
//!
//! Servers present their self-signed ed25519 certificate and offer both the
//! user and tracker protocol identifiers. Clients do not present a TLS
//! certificate; they prove their identity afterwards with a
//! `ClientCertReq`. Server certificates are not chained to any root: a
//! client either pins the exact certificate it expects or accepts any
//! certificate and binds the peer identity by hashing it.

use crate::transport::{ConnectOptions, Connection, Connector, Listener, RawStream};
use async_trait::async_trait;
use pie_core::{Certificate, Error, Protocol, Result};
use quinn::crypto::rustls::{HandshakeData, QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, IdleTimeout, TransportConfig, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// TLS server name sent by clients
const SERVER_NAME: &str = "pie";

/// Interval between keep-alive packets
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Idle period after which a connection is dropped
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config() -> Result<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(
        IdleTimeout::try_from(MAX_IDLE_TIMEOUT)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?,
    ));
    Ok(Arc::new(transport))
}

/// Accepts any server certificate, or exactly the pinned one
#[derive(Debug)]
struct PeerCertVerifier {
    pinned: Option<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(pinned) if pinned.as_slice() != end_entity.as_ref() => Err(
                rustls::Error::General("server certificate mismatch".to_string()),
            ),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_config(options: &ConnectOptions) -> Result<quinn::ClientConfig> {
    let provider = provider();
    let verifier = PeerCertVerifier {
        pinned: options.pinned_server_cert.clone(),
        provider: provider.clone(),
    };
    let mut tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::InvalidConfig(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    tls.alpn_protocols = vec![options.protocol.alpn().to_vec()];

    let crypto = QuicClientConfig::try_from(tls).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

fn server_config(cert: &Certificate) -> Result<quinn::ServerConfig> {
    let chain = vec![CertificateDer::from(cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_der().to_vec()));
    let mut tls = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::InvalidConfig(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::InvalidConfig(format!("invalid server certificate: {e}")))?;
    tls.alpn_protocols = vec![
        Protocol::User.alpn().to_vec(),
        Protocol::Tracker.alpn().to_vec(),
    ];

    let crypto = QuicServerConfig::try_from(tls).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

fn map_connection_error(err: ConnectionError) -> Error {
    match err {
        ConnectionError::TimedOut => Error::TimedOut,
        ConnectionError::LocallyClosed
        | ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::Reset => Error::Closed(err.to_string()),
        other => Error::Unknown(other.to_string()),
    }
}

/// An established QUIC connection
pub struct QuicConnection {
    conn: quinn::Connection,
    protocol: Protocol,
}

impl QuicConnection {
    fn new(conn: quinn::Connection) -> Result<Self> {
        let negotiated = conn
            .handshake_data()
            .and_then(|data| data.downcast::<HandshakeData>().ok())
            .and_then(|data| data.protocol)
            .and_then(|alpn| Protocol::from_alpn(&alpn));
        match negotiated {
            Some(protocol) => Ok(Self { conn, protocol }),
            None => {
                conn.close(VarInt::from_u32(0), b"no application protocol");
                Err(Error::InvalidMessage(
                    "no application protocol negotiated".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl Connection for QuicConnection {
    async fn open_bi(&self) -> Result<RawStream> {
        let (send, recv) = self.conn.open_bi().await.map_err(map_connection_error)?;
        Ok(RawStream {
            id: VarInt::from(send.id()).into_inner(),
            send: Box::new(send),
            recv: Box::new(recv),
        })
    }

    async fn accept_bi(&self) -> Result<RawStream> {
        let (send, recv) = self.conn.accept_bi().await.map_err(map_connection_error)?;
        Ok(RawStream {
            id: VarInt::from(send.id()).into_inner(),
            send: Box::new(send),
            recv: Box::new(recv),
        })
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        let identity = self.conn.peer_identity()?;
        let chain = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
        chain.first().map(|cert| cert.as_ref().to_vec())
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn remote_address(&self) -> String {
        self.conn.remote_address().to_string()
    }

    fn close(&self, code: u32) {
        self.conn.close(VarInt::from_u32(code), b"");
    }
}

/// Dials QUIC connections from a local endpoint
#[derive(Clone)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    /// Use an existing endpoint, typically the one a listener is bound to
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Bind a client-only endpoint on an OS-assigned port
    ///
    /// # Errors
    ///
    /// Returns the socket error when binding fails.
    pub fn bind_client() -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], 0));
        let endpoint = Endpoint::client(addr)?;
        Ok(Self { endpoint })
    }

    async fn resolve(&self, addr: &str) -> Result<SocketAddr> {
        let local_is_v4 = self.endpoint.local_addr()?.is_ipv4();
        let resolved: Vec<SocketAddr> = tokio::net::lookup_host(addr).await?.collect();
        resolved
            .iter()
            .find(|candidate| candidate.is_ipv4() == local_is_v4)
            .or_else(|| resolved.first())
            .copied()
            .ok_or_else(|| Error::Unknown(format!("address {addr} did not resolve")))
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self, addr: &str, options: &ConnectOptions) -> Result<Arc<dyn Connection>> {
        let remote = self.resolve(addr).await?;
        let connecting = self
            .endpoint
            .connect_with(client_config(options)?, remote, SERVER_NAME)
            .map_err(|e| Error::Unknown(format!("failed to connect to {addr}: {e}")))?;
        let conn = connecting.await.map_err(map_connection_error)?;
        Ok(Arc::new(QuicConnection::new(conn)?))
    }
}

/// QUIC endpoint accepting user and tracker connections
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    /// Bind `addr`, falling back to an OS-assigned port when it is in use
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unparsable address or
    /// unusable certificate, and the socket error when binding fails.
    pub fn bind(addr: &str, cert: &Certificate) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid listen address {addr}: {e}")))?;
        let config = server_config(cert)?;

        let endpoint = match Endpoint::server(config.clone(), addr) {
            Ok(endpoint) => endpoint,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!("Address {} in use, binding an ephemeral port", addr);
                Endpoint::server(config, SocketAddr::new(addr.ip(), 0))?
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!("Listening on {}", endpoint.local_addr()?);
        Ok(Self { endpoint })
    }

    /// A connector sharing this listener's socket
    #[must_use]
    pub fn connector(&self) -> QuicConnector {
        QuicConnector::new(self.endpoint.clone())
    }
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| Error::Closed("endpoint closed".to_string()))?;
        let conn = incoming.await.map_err(map_connection_error)?;
        Ok(Arc::new(QuicConnection::new(conn)?))
    }

    fn local_addr(&self) -> String {
        self.endpoint
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"");
    }
}

//! Transport trait abstraction for multiple connection backends.
//!
//! Pie needs a reliable, multiplexed, authenticated connection: one
//! session carrying many independent ordered streams. The traits here
//! describe that shape so the session and discovery layers work the same
//! over QUIC and over the in-process [`memory`](crate::memory) network.

use async_trait::async_trait;
use pie_core::{ByteReader, ByteWriter, Protocol, Result, Stream};
use std::sync::Arc;

/// A freshly opened or accepted bidirectional stream, before framing
pub struct RawStream {
    /// Transport-assigned stream id
    pub id: u64,
    /// Send half
    pub send: ByteWriter,
    /// Receive half
    pub recv: ByteReader,
}

impl RawStream {
    /// Wrap in a framed [`Stream`], optionally reusing a receive buffer
    #[must_use]
    pub fn into_stream(self, recv_buf: Option<Vec<u8>>) -> Stream {
        Stream::with_buffer(self.id, self.recv, self.send, recv_buf.unwrap_or_default())
    }
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStream").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Parameters of an outgoing connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Role to negotiate
    pub protocol: Protocol,
    /// Exact server certificate DER to accept, if any
    pub pinned_server_cert: Option<Vec<u8>>,
}

impl ConnectOptions {
    /// Options for `protocol` accepting any server certificate
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            pinned_server_cert: None,
        }
    }

    /// Only accept a server presenting `cert_der`
    #[must_use]
    pub fn with_pinned_cert(mut self, cert_der: Vec<u8>) -> Self {
        self.pinned_server_cert = Some(cert_der);
        self
    }
}

/// One established, encrypted connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new bidirectional stream
    async fn open_bi(&self) -> Result<RawStream>;

    /// Wait for the peer to open a bidirectional stream
    ///
    /// Returns [`Error::Closed`](pie_core::Error::Closed) once the
    /// connection is closed by either side.
    async fn accept_bi(&self) -> Result<RawStream>;

    /// Peer leaf certificate DER, when the peer presented one
    fn peer_certificate(&self) -> Option<Vec<u8>>;

    /// Negotiated role
    fn protocol(&self) -> Protocol;

    /// Printable peer address
    fn remote_address(&self) -> String;

    /// Close with an application error code
    fn close(&self, code: u32);
}

/// Dials outgoing connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to one address
    async fn connect(&self, addr: &str, options: &ConnectOptions) -> Result<Arc<dyn Connection>>;
}

/// Accepts incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next incoming connection
    async fn accept(&self) -> Result<Arc<dyn Connection>>;

    /// Bound address
    fn local_addr(&self) -> String;

    /// Stop accepting; pending and future accepts fail with `Closed`
    fn close(&self);
}

//! Sessions: one encrypted connection carrying many framed streams.
//!
//! The connecting side of a session proves its identity by opening a
//! stream and sending a `ClientCertReq`: its own certificate plus a
//! signature over the server's identity hash. The hash covers the server
//! leaf certificate and its length depends on the negotiated protocol
//! (20 bytes for user connections, 50 for tracker connections).

use crate::transport::{ConnectOptions, Connection, Connector};
use pie_core::{
    Certificate, ClientCertReq, Context, Error, Id, NetMessage, Protocol, Result, Stream,
    hash_bytes,
};
use std::sync::Arc;
use tokio::time::Instant;

/// Close code for a session ended without a specific reason
pub const CLOSE_NO_REASON: u32 = 0;

/// Close code for a session whose requested peer is unknown
pub const CLOSE_NOT_FOUND: u32 = 1;

/// An established session with a remote peer
#[derive(Clone)]
pub struct Session {
    conn: Arc<dyn Connection>,
}

impl Session {
    /// Wrap an established connection
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    /// Connect to the first reachable address in `addrs`
    ///
    /// Addresses are tried in order; the first successful connection wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAddress`] for an empty list,
    /// [`Error::Canceled`] when `ctx` is cancelled, and otherwise the error
    /// of the last address tried.
    pub async fn connect(
        ctx: &Context,
        connector: &dyn Connector,
        options: &ConnectOptions,
        addrs: &[String],
    ) -> Result<Self> {
        let mut last_err = Error::NoAddress;
        for addr in addrs {
            match ctx.run(connector.connect(addr, options)).await {
                Ok(conn) => {
                    tracing::debug!("Connected to {} ({})", addr, options.protocol);
                    return Ok(Self::new(conn));
                }
                Err(Error::Canceled) => return Err(Error::Canceled),
                Err(e) => {
                    tracing::debug!("Failed to connect to {}: {}", addr, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Open a framed stream with a default receive buffer
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the session is closed.
    pub async fn open_stream(&self) -> Result<Stream> {
        self.open_stream_with_buffer(Vec::new()).await
    }

    /// Open a framed stream reusing `recv_buf`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the session is closed.
    pub async fn open_stream_with_buffer(&self, recv_buf: Vec<u8>) -> Result<Stream> {
        let raw = self.conn.open_bi().await.inspect_err(|e| {
            if !e.is_expected() {
                tracing::warn!("Failed to open stream to {}: {}", self.remote_address(), e);
            }
        })?;
        Ok(raw.into_stream(Some(recv_buf)))
    }

    /// Wait for the peer to open a stream
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`] when `ctx` is cancelled,
    /// [`Error::TimedOut`] when `deadline` passes and [`Error::Closed`] when
    /// the session ends.
    pub async fn accept_stream(&self, ctx: &Context, deadline: Option<Instant>) -> Result<Stream> {
        self.accept_stream_with_buffer(ctx, deadline, Vec::new()).await
    }

    /// Wait for the peer to open a stream, reusing `recv_buf`
    ///
    /// # Errors
    ///
    /// See [`Session::accept_stream`].
    pub async fn accept_stream_with_buffer(
        &self,
        ctx: &Context,
        deadline: Option<Instant>,
        recv_buf: Vec<u8>,
    ) -> Result<Stream> {
        let accept = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.conn.accept_bi()).await?,
                None => self.conn.accept_bi().await,
            }
        };
        let raw = ctx.run(accept).await.inspect_err(|e| {
            if !e.is_expected() {
                tracing::warn!("Failed to accept stream from {}: {}", self.remote_address(), e);
            }
        })?;
        Ok(raw.into_stream(Some(recv_buf)))
    }

    /// Announce the local identity to the peer
    ///
    /// Signs the peer's identity hash with `cert` and sends a
    /// `ClientCertReq` carrying `cert` and the optional requested `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureInvalid`] if the peer presented no
    /// certificate, or the stream error if sending fails.
    pub async fn send_identity(&self, cert: &Certificate, id: Option<&Id>) -> Result<()> {
        let server_cert = self.conn.peer_certificate().ok_or_else(|| {
            Error::SignatureInvalid("peer presented no certificate".to_string())
        })?;
        let server_hash = hash_bytes(&server_cert, self.protocol().identity_hash_len());

        let mut stream = self.open_stream().await?;
        tracing::debug!("Sending certificate on stream {}", stream.id());
        let message = NetMessage::ClientCertReq(ClientCertReq {
            id: id.map(Id::to_vec),
            cert_der: cert.der().to_vec(),
            server_cert_sign: cert.sign(&server_hash),
        });
        stream.send_message(&message, None).await?;
        stream.close().await
    }

    /// Peer leaf certificate DER
    #[must_use]
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.conn.peer_certificate()
    }

    /// Identifier derived from the peer's certificate
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureInvalid`] if the peer presented no
    /// certificate.
    pub fn peer_id(&self) -> Result<Id> {
        self.conn
            .peer_certificate()
            .map(|der| Id::from_cert_der(&der))
            .ok_or_else(|| Error::SignatureInvalid("peer presented no certificate".to_string()))
    }

    /// Negotiated role
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.conn.protocol()
    }

    /// Printable peer address
    #[must_use]
    pub fn remote_address(&self) -> String {
        self.conn.remote_address()
    }

    /// Close the session with an application error code
    pub fn close(&self, code: u32) {
        tracing::debug!("Closing session with {} (code {})", self.remote_address(), code);
        self.conn.close(code);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("remote", &self.remote_address())
            .field("protocol", &self.protocol())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::transport::Listener;
    use pie_core::verify_signature;
    use std::time::Duration;

    async fn connected_pair(protocol: Protocol) -> (Session, Session, Certificate) {
        let server_cert = Certificate::generate().unwrap().certificate;
        let network = MemoryNetwork::new();
        let listener = network.listen("tracker:1", server_cert.der().to_vec());
        let client = Session::connect(
            &Context::background(),
            &network.connector(),
            &ConnectOptions::new(protocol),
            &["tracker:1".to_string()],
        )
        .await
        .unwrap();
        let server = Session::new(listener.accept().await.unwrap());
        (client, server, server_cert)
    }

    #[tokio::test]
    async fn test_connect_empty_address_list() {
        let network = MemoryNetwork::new();
        let err = Session::connect(
            &Context::background(),
            &network.connector(),
            &ConnectOptions::new(Protocol::User),
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NoAddress));
    }

    #[tokio::test]
    async fn test_connect_tries_addresses_in_order() {
        let network = MemoryNetwork::new();
        let _listener = network.listen("second:1", vec![5]);
        let session = Session::connect(
            &Context::background(),
            &network.connector(),
            &ConnectOptions::new(Protocol::User),
            &["first:1".to_string(), "second:1".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(session.remote_address(), "second:1");
        assert_eq!(session.peer_id().unwrap(), Id::from_cert_der(&[5]));
    }

    #[tokio::test]
    async fn test_connect_all_fail_returns_last_error() {
        let network = MemoryNetwork::new();
        let err = Session::connect(
            &Context::background(),
            &network.connector(),
            &ConnectOptions::new(Protocol::User),
            &["a:1".to_string(), "b:1".to_string()],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("b:1"));
    }

    #[tokio::test]
    async fn test_connect_canceled() {
        let network = MemoryNetwork::new();
        let _listener = network.listen("tracker:1", vec![5]);
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();
        let err = Session::connect(
            &ctx,
            &network.connector(),
            &ConnectOptions::new(Protocol::User),
            &["tracker:1".to_string()],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }

    #[tokio::test]
    async fn test_accept_outcomes_are_distinct() {
        let (client, server, _) = connected_pair(Protocol::User).await;

        let deadline = Instant::now() + Duration::from_millis(20);
        let err = server
            .accept_stream(&Context::background(), Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut));

        let (ctx, handle) = Context::with_cancel();
        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.accept_stream(&ctx, None).await.map(|_| ()) })
        };
        handle.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Canceled)));

        client.close(CLOSE_NO_REASON);
        let err = server
            .accept_stream(&Context::background(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }

    #[tokio::test]
    async fn test_send_identity_signature_verifies() {
        for protocol in [Protocol::User, Protocol::Tracker] {
            let (client, server, server_cert) = connected_pair(protocol).await;
            let client_cert = Certificate::generate().unwrap().certificate;
            let requested = Id::random();

            client.send_identity(&client_cert, Some(&requested)).await.unwrap();

            let mut stream = server.accept_stream(&Context::background(), None).await.unwrap();
            let NetMessage::ClientCertReq(req) = stream.recv_message(None).await.unwrap() else {
                panic!("expected ClientCertReq");
            };
            assert_eq!(req.id, Some(requested.to_vec()));
            assert_eq!(req.cert_der, client_cert.der());

            let hash = hash_bytes(server_cert.der(), protocol.identity_hash_len());
            verify_signature(&req.cert_der, &hash, &req.server_cert_sign).unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_identity_requires_peer_cert() {
        let (_client, server, _) = connected_pair(Protocol::Tracker).await;
        let cert = Certificate::generate().unwrap().certificate;
        let err = server.send_identity(&cert, None).await.unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid(_)));
    }
}

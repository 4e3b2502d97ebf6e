//! Listening side of Pie sessions.

use crate::quic::QuicListener;
use crate::session::Session;
use crate::transport::Listener;
use pie_core::{Certificate, Context, Protocol, Result, hash_bytes, verify_signature};
use std::sync::Arc;

/// Accepts sessions and verifies client identity announcements
pub struct Server {
    listener: Arc<dyn Listener>,
    cert_der: Vec<u8>,
}

impl Server {
    /// Serve on an existing listener presenting `cert_der`
    #[must_use]
    pub fn new(listener: Arc<dyn Listener>, cert_der: Vec<u8>) -> Self {
        Self { listener, cert_der }
    }

    /// Listen for QUIC connections on `addr`
    ///
    /// Falls back to an OS-assigned port when `addr` is in use.
    ///
    /// # Errors
    ///
    /// See [`QuicListener::bind`].
    pub fn listen(addr: &str, cert: &Certificate) -> Result<Self> {
        let listener = QuicListener::bind(addr, cert)?;
        Ok(Self::new(Arc::new(listener), cert.der().to_vec()))
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> String {
        self.listener.local_addr()
    }

    /// Wait for the next session
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`](pie_core::Error::Canceled) when `ctx` is
    /// cancelled and [`Error::Closed`](pie_core::Error::Closed) once the
    /// server is closed.
    pub async fn accept_session(&self, ctx: &Context) -> Result<Session> {
        let conn = ctx.run(self.listener.accept()).await.inspect_err(|e| {
            if !e.is_expected() {
                tracing::warn!("Failed to accept session: {}", e);
            }
        })?;
        tracing::debug!(
            "Accepted session from {} ({})",
            conn.remote_address(),
            conn.protocol()
        );
        Ok(Session::new(conn))
    }

    /// Identity hash clients sign on connections of `protocol`
    #[must_use]
    pub fn cert_hash(&self, protocol: Protocol) -> Vec<u8> {
        hash_bytes(&self.cert_der, protocol.identity_hash_len())
    }

    /// Verify a client's signature over this server's identity hash
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureInvalid`](pie_core::Error::SignatureInvalid)
    /// if the certificate does not parse or the signature does not match.
    pub fn verify_client_cert(
        &self,
        client_cert_der: &[u8],
        server_cert_sign: &[u8],
        protocol: Protocol,
    ) -> Result<()> {
        verify_signature(client_cert_der, &self.cert_hash(protocol), server_cert_sign).inspect_err(
            |e| tracing::warn!("Failed to verify client certificate: {}", e),
        )
    }

    /// Stop accepting sessions
    pub fn close(&self) {
        self.listener.close();
    }
}

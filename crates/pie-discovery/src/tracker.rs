//! Remote tracker handles.
//!
//! A [`Tracker`] names a remote peer by identifier and candidate addresses
//! and owns at most one live [`Session`] to it. The session is established
//! lazily; concurrent callers of [`Tracker::connect`] are serialized so
//! that only one of them dials and the others reuse its session.

use pie_core::{Certificate, Context, Error, Id, Protocol, Result};
use pie_transport::{CLOSE_NO_REASON, ConnectOptions, Connector, Session};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// A remote tracker
pub struct Tracker {
    id: RwLock<Id>,
    addr: RwLock<Vec<String>>,
    session: RwLock<Option<Session>>,
    connecting: tokio::sync::Mutex<()>,
    live: AtomicBool,
}

impl Tracker {
    /// A tracker with a known identifier
    #[must_use]
    pub fn new(id: Id, addr: Vec<String>) -> Self {
        Self {
            id: RwLock::new(id),
            addr: RwLock::new(addr),
            session: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
            live: AtomicBool::new(false),
        }
    }

    /// A tracker whose identifier is learned on first contact
    #[must_use]
    pub fn unknown(addr: Vec<String>) -> Self {
        Self::new(Id::ZERO, addr)
    }

    /// Tracker identifier, zero until known
    #[must_use]
    pub fn id(&self) -> Id {
        *self.id.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Candidate addresses in preference order
    #[must_use]
    pub fn addr(&self) -> Vec<String> {
        self.addr.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the candidate addresses
    pub fn set_addr(&self, addr: Vec<String>) {
        *self.addr.write().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    /// Addresses as a JSON array string
    #[must_use]
    pub fn addr_json(&self) -> String {
        serde_json::to_string(&*self.addr.read().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or_default()
    }

    /// Replace the addresses from a JSON array string
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if `json` is not an array of
    /// strings; the addresses are left unchanged.
    pub fn set_addr_json(&self, json: &str) -> Result<()> {
        let addr: Vec<String> = serde_json::from_str(json).map_err(|e| {
            tracing::warn!("Failed to parse tracker address: {}", e);
            Error::InvalidMessage(format!("invalid tracker address: {e}"))
        })?;
        self.set_addr(addr);
        Ok(())
    }

    /// Current session, if connected
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns true while a session is established
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Connect, or reuse the established session
    ///
    /// On the tracker protocol the local identity is announced with `cert`.
    /// An unknown identifier is filled in from the peer certificate; a known
    /// identifier must match it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the tracker protocol is used
    /// without a certificate, [`Error::SignatureInvalid`] when the peer
    /// certificate does not match the expected identifier, and otherwise
    /// the connection or handshake error.
    pub async fn connect(
        &self,
        ctx: &Context,
        connector: &dyn Connector,
        options: &ConnectOptions,
        cert: Option<&Certificate>,
    ) -> Result<Session> {
        let _guard = self.connecting.lock().await;
        if let Some(session) = self.session() {
            return Ok(session);
        }
        if options.protocol == Protocol::Tracker && cert.is_none() {
            return Err(Error::InvalidConfig(
                "tracker connections require a local certificate".to_string(),
            ));
        }

        let addr = self.addr();
        tracing::debug!("Connecting to tracker {:?} at {:?}", self.id(), addr);
        let session = Session::connect(ctx, connector, options, &addr).await?;
        if let Err(e) = self.bind_session(ctx, &session, cert).await {
            session.close(CLOSE_NO_REASON);
            return Err(e);
        }

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        self.live.store(true, Ordering::Release);
        Ok(session)
    }

    async fn bind_session(
        &self,
        ctx: &Context,
        session: &Session,
        cert: Option<&Certificate>,
    ) -> Result<()> {
        if let (Protocol::Tracker, Some(cert)) = (session.protocol(), cert) {
            ctx.run(session.send_identity(cert, None)).await?;
        }

        let peer_id = session.peer_id()?;
        let mut id = self.id.write().unwrap_or_else(PoisonError::into_inner);
        if id.is_zero() {
            *id = peer_id;
        } else if *id != peer_id {
            tracing::warn!(
                "Tracker at {} presented {:?}, expected {:?}",
                session.remote_address(),
                peer_id,
                *id
            );
            return Err(Error::SignatureInvalid(
                "peer certificate does not match tracker id".to_string(),
            ));
        }
        Ok(())
    }

    /// Close the session, if any
    pub fn disconnect(&self) {
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.live.store(false, Ordering::Release);
        if let Some(session) = session {
            session.close(CLOSE_NO_REASON);
        }
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("id", &self.id())
            .field("addr", &self.addr())
            .field("live", &self.is_live())
            .finish()
    }
}

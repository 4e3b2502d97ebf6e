//! Answering side of the lookup protocol.
//!
//! A [`Responder`] serves the streams of accepted sessions:
//!
//! - `FindTrackerReq` is answered with the nearest known trackers,
//!   excluding the requester once its identity is verified
//! - `ClientCertReq` is verified against the local certificate and
//!   reported as a [`ClientIdentity`]

use crate::table::RoutingTable;
use pie_core::{
    Candidate, ClientCertReq, Context, Error, FindTrackerReq, FindTrackerRes, Id, NetMessage,
    Result, Status, Stream,
};
use pie_transport::{Server, Session};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// A verified identity announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Identifier derived from the client certificate
    pub peer_id: Id,
    /// Identifier the client asked to reach, if any
    pub requested_id: Option<Id>,
    /// Client leaf certificate (DER)
    pub cert_der: Vec<u8>,
}

/// Serves lookup and identity streams from a routing table
pub struct Responder {
    table: Arc<RoutingTable>,
    server: Arc<Server>,
    identities: Option<mpsc::UnboundedSender<ClientIdentity>>,
}

impl Responder {
    /// Responder answering sessions accepted by `server`
    #[must_use]
    pub fn new(table: Arc<RoutingTable>, server: Arc<Server>) -> Self {
        Self {
            table,
            server,
            identities: None,
        }
    }

    /// Report verified client identities on `tx`
    #[must_use]
    pub fn with_identity_sink(mut self, tx: mpsc::UnboundedSender<ClientIdentity>) -> Self {
        self.identities = Some(tx);
        self
    }

    /// Accept sessions and serve each one
    ///
    /// Returns when `ctx` is cancelled or the server is closed. Session
    /// tasks are joined before returning.
    pub async fn serve(self: &Arc<Self>, ctx: &Context) {
        let mut sessions = JoinSet::new();
        // Outlives finished session tasks so a handshake in progress is kept
        let accept = self.server.accept_session(ctx);
        tokio::pin!(accept);
        loop {
            let session = tokio::select! {
                res = &mut accept => {
                    accept.set(self.server.accept_session(ctx));
                    res
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Session task failed: {}", e);
                    }
                    continue;
                }
            };
            match session {
                Ok(session) => {
                    let responder = Arc::clone(self);
                    let ctx = ctx.clone();
                    sessions.spawn(async move { responder.serve_session(&ctx, session).await });
                }
                Err(e @ (Error::Canceled | Error::Closed(_))) => {
                    tracing::debug!("Stopped accepting sessions: {}", e);
                    break;
                }
                // A failed handshake only affects that peer
                Err(e) => tracing::debug!("Dropped incoming session: {}", e),
            }
        }
        sessions.shutdown().await;
    }

    /// Serve streams of one session until it closes or `ctx` is cancelled
    pub async fn serve_session(self: &Arc<Self>, ctx: &Context, session: Session) {
        let requester = Arc::new(Mutex::new(None));
        let mut streams = JoinSet::new();
        loop {
            let stream = tokio::select! {
                res = session.accept_stream(ctx, None) => res,
                Some(joined) = streams.join_next(), if !streams.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Stream task failed: {}", e);
                    }
                    continue;
                }
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    if !e.is_expected() {
                        tracing::warn!("Session with {} ended: {}", session.remote_address(), e);
                    }
                    break;
                }
            };

            let responder = Arc::clone(self);
            let session = session.clone();
            let requester = Arc::clone(&requester);
            streams.spawn(async move {
                if let Err(e) = responder.handle_stream(&session, stream, &requester).await {
                    if !e.is_expected() {
                        tracing::debug!("Stream from {} failed: {}", session.remote_address(), e);
                    }
                }
            });
        }
        while let Some(joined) = streams.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Stream task failed: {}", e);
            }
        }
    }

    async fn handle_stream(
        &self,
        session: &Session,
        mut stream: Stream,
        requester: &Mutex<Option<Id>>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.table.config().request_timeout;
        match stream.recv_message(Some(deadline)).await? {
            NetMessage::FindTrackerReq(req) => {
                let exclude = *requester.lock().unwrap_or_else(PoisonError::into_inner);
                let res = self.find_tracker_response(&req, exclude.as_ref());
                stream
                    .send_message(&NetMessage::FindTrackerRes(res), Some(deadline))
                    .await?;
                stream.close().await
            }
            NetMessage::ClientCertReq(req) => {
                let identity = self.verify_identity(session, req)?;
                tracing::debug!(
                    "Client {:?} at {} verified",
                    identity.peer_id,
                    session.remote_address()
                );
                *requester.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity.peer_id);
                if let Some(tx) = &self.identities {
                    // Receiver gone means nobody is interested
                    let _ = tx.send(identity);
                }
                Ok(())
            }
            other => Err(Error::InvalidMessage(format!(
                "unexpected {} on incoming stream",
                other.message_type()
            ))),
        }
    }

    /// Build the answer to a lookup request
    #[must_use]
    pub fn find_tracker_response(&self, req: &FindTrackerReq, exclude: Option<&Id>) -> FindTrackerRes {
        let Ok(target) = Id::from_slice(&req.id) else {
            return FindTrackerRes::error(Status::InvalidRequest);
        };
        let candidates = self
            .table
            .nearest(&target, self.table.config().response_candidates, exclude)
            .iter()
            .map(|tracker| Candidate {
                id: tracker.id().to_vec(),
                addr: tracker.addr(),
            })
            .collect();
        FindTrackerRes {
            status: Status::Ok,
            candidates,
        }
    }

    fn verify_identity(&self, session: &Session, req: ClientCertReq) -> Result<ClientIdentity> {
        self.server
            .verify_client_cert(&req.cert_der, &req.server_cert_sign, session.protocol())
            .inspect_err(|_| {
                tracing::debug!("Rejected identity from {}", session.remote_address());
            })?;
        let requested_id = req.id.as_deref().map(Id::from_slice).transpose()?;
        Ok(ClientIdentity {
            peer_id: Id::from_cert_der(&req.cert_der),
            requested_id,
            cert_der: req.cert_der,
        })
    }
}

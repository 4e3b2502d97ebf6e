//! Wire messages exchanged on framed streams.
//!
//! The set of messages is closed: a frame payload decodes into exactly one
//! [`NetMessage`] variant or fails with [`Error::InvalidMessage`]. Payloads
//! are a schema version byte followed by the bincode body.

use crate::error::{Error, Result};
use crate::id::Id;
use crate::MAX_MESSAGE_LEN;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Schema version prefixed to every payload
pub const WIRE_VERSION: u8 = 1;

/// Outcome carried by a [`FindTrackerRes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Request served
    Ok,
    /// Request was malformed
    InvalidRequest,
    /// Responder could not serve the request
    Unavailable,
}

/// Ask a tracker for the peers it knows nearest to `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindTrackerReq {
    /// Target identifier
    pub id: Vec<u8>,
}

/// One peer reported by a tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Peer identifier
    pub id: Vec<u8>,
    /// Candidate endpoints in preference order
    pub addr: Vec<String>,
}

/// Answer to a [`FindTrackerReq`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindTrackerRes {
    /// Request outcome
    pub status: Status,
    /// Nearest known peers, nearest first
    pub candidates: Vec<Candidate>,
}

/// Identity announcement sent by the connecting side of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertReq {
    /// Identifier the client asks to be known by
    pub id: Option<Vec<u8>>,
    /// Client leaf certificate (DER)
    pub cert_der: Vec<u8>,
    /// Client signature over the server identity hash
    pub server_cert_sign: Vec<u8>,
}

/// Frame payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMessage {
    /// Peer lookup request
    FindTrackerReq(FindTrackerReq),
    /// Peer lookup response
    FindTrackerRes(FindTrackerRes),
    /// Client identity announcement
    ClientCertReq(ClientCertReq),
}

impl FindTrackerReq {
    /// Request for `target`
    #[must_use]
    pub fn new(target: &Id) -> Self {
        Self {
            id: target.to_vec(),
        }
    }
}

impl Candidate {
    /// Parse the candidate identifier
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] unless the identifier has the
    /// exact identifier length.
    pub fn parse_id(&self) -> Result<Id> {
        Id::from_slice(&self.id)
    }
}

impl FindTrackerRes {
    /// Response with a non-OK status and no candidates
    #[must_use]
    pub fn error(status: Status) -> Self {
        Self {
            status,
            candidates: Vec::new(),
        }
    }
}

impl NetMessage {
    /// Serialize into a frame payload
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![WIRE_VERSION];
        codec()
            .serialize_into(&mut out, self)
            .map_err(|e| Error::InvalidMessage(format!("failed to encode message: {e}")))?;
        Ok(out)
    }

    /// Deserialize a frame payload
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] for an unknown schema version or a
    /// body that does not decode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&WIRE_VERSION, body)) => codec()
                .deserialize(body)
                .map_err(|e| Error::InvalidMessage(format!("failed to decode message: {e}"))),
            Some((version, _)) => Err(Error::InvalidMessage(format!(
                "unsupported wire version {version}"
            ))),
            None => Err(Error::InvalidMessage("empty payload".to_string())),
        }
    }

    /// Message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::FindTrackerReq(_) => "FindTrackerReq",
            Self::FindTrackerRes(_) => "FindTrackerRes",
            Self::ClientCertReq(_) => "ClientCertReq",
        }
    }
}

impl From<FindTrackerReq> for NetMessage {
    fn from(req: FindTrackerReq) -> Self {
        Self::FindTrackerReq(req)
    }
}

impl From<FindTrackerRes> for NetMessage {
    fn from(res: FindTrackerRes) -> Self {
        Self::FindTrackerRes(res)
    }
}

impl From<ClientCertReq> for NetMessage {
    fn from(req: ClientCertReq) -> Self {
        Self::ClientCertReq(req)
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_LEN as u64)
}

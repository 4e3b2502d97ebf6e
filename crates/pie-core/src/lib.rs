//! # Pie Core
//!
//! Core building blocks shared by every Pie overlay node.
//!
//! This crate provides:
//! - Fixed-width peer identifiers derived from certificate hashes (SHAKE-256)
//! - The error taxonomy used across transport, session and discovery layers
//! - Cancellation contexts for blocking network operations
//! - Length-prefixed message framing over ordered byte streams
//! - The closed set of wire messages used for discovery and identity binding
//! - Ed25519 certificate generation, loading and signature verification
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Messages                                 │
//! │   (FindTrackerReq / FindTrackerRes / ClientCertReq)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Stream                                   │
//! │   (varint(len) || payload frames, partial-read buffering)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   Ordered byte transport                         │
//! │   (one direction pair of a multiplexed QUIC stream)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod certificate;
pub mod context;
pub mod error;
pub mod id;
pub mod message;
pub mod stream;
pub mod varint;

pub use certificate::{Certificate, GeneratedCertificate, verify_signature};
pub use context::{CancelHandle, Context};
pub use error::{Error, ErrorCode, Result};
pub use id::{Id, hash_bytes};
pub use message::{
    Candidate, ClientCertReq, FindTrackerReq, FindTrackerRes, NetMessage, Status, WIRE_VERSION,
};
pub use stream::{ByteReader, ByteWriter, Stream};

/// Size in bytes of a peer identifier
pub const K_SIZE: usize = 24;

/// Parallelism of one discovery round (trackers queried per round)
pub const ALPHA: usize = 3;

/// Number of candidates a tracker returns for one `FindTrackerReq`
pub const K: usize = 20;

/// Identifier length in bytes
pub const ID_LEN: usize = K_SIZE;

/// Identifier length in bits
pub const ID_BITS: usize = ID_LEN * 8;

/// Identity hash length signed on user connections
pub const USER_CERT_HASH_LEN: usize = 20;

/// Identity hash length signed on tracker connections
pub const SERVER_CERT_HASH_LEN: usize = 50;

/// Largest output accepted by [`hash_bytes`]
pub const MAX_HASH_LEN: usize = 128;

/// Largest frame (length prefix included) allowed on a stream
pub const MAX_MESSAGE_LEN: usize = 2 * 1024 * 1024;

/// ALPN identifier negotiated by users connecting to a peer
pub const USER_TLS_PROTO: &str = "pie-q-u-1";

/// ALPN identifier negotiated between trackers
pub const TRACKER_TLS_PROTO: &str = "pie-q-t-1";

/// Role of a connection, selected through ALPN negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// User-to-peer connection
    User,
    /// Peer-to-tracker connection
    Tracker,
}

impl Protocol {
    /// ALPN bytes for this role
    #[must_use]
    pub const fn alpn(self) -> &'static [u8] {
        match self {
            Self::User => USER_TLS_PROTO.as_bytes(),
            Self::Tracker => TRACKER_TLS_PROTO.as_bytes(),
        }
    }

    /// Resolve a negotiated ALPN identifier
    #[must_use]
    pub fn from_alpn(alpn: &[u8]) -> Option<Self> {
        if alpn == USER_TLS_PROTO.as_bytes() {
            Some(Self::User)
        } else if alpn == TRACKER_TLS_PROTO.as_bytes() {
            Some(Self::Tracker)
        } else {
            None
        }
    }

    /// Length of the server identity hash signed during the identity handshake
    #[must_use]
    pub const fn identity_hash_len(self) -> usize {
        match self {
            Self::User => USER_CERT_HASH_LEN,
            Self::Tracker => SERVER_CERT_HASH_LEN,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str(USER_TLS_PROTO),
            Self::Tracker => f.write_str(TRACKER_TLS_PROTO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_alpn_roundtrip() {
        for protocol in [Protocol::User, Protocol::Tracker] {
            assert_eq!(Protocol::from_alpn(protocol.alpn()), Some(protocol));
        }
        assert_eq!(Protocol::from_alpn(b"h3"), None);
    }

    #[test]
    fn test_identity_hash_len() {
        assert_eq!(Protocol::User.identity_hash_len(), 20);
        assert_eq!(Protocol::Tracker.identity_hash_len(), 50);
    }

    #[test]
    fn test_constants() {
        assert_eq!(ID_LEN, 24);
        assert_eq!(ID_BITS, 192);
        assert_eq!(MAX_MESSAGE_LEN, 2_097_152);
        assert_eq!(Protocol::Tracker.to_string(), "pie-q-t-1");
    }
}

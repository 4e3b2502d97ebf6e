//! # Pie Transport
//!
//! Session layer for Pie overlay nodes.
//!
//! This crate provides:
//! - Connector, listener and connection traits over multiplexed transports
//! - A QUIC backend (`quinn` + `rustls`) negotiating the user and tracker
//!   protocol identifiers
//! - An in-process backend for tests and embedding
//! - [`Session`]: framed streams and the certificate identity handshake
//! - [`Server`]: session acceptance and client signature verification

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod quic;
pub mod server;
pub mod session;
pub mod transport;

pub use memory::{MemoryConnector, MemoryListener, MemoryNetwork};
pub use quic::{QuicConnector, QuicListener};
pub use server::Server;
pub use session::{CLOSE_NO_REASON, CLOSE_NOT_FOUND, Session};
pub use transport::{ConnectOptions, Connection, Connector, Listener, RawStream};

//! # Pie Discovery
//!
//! Tracker discovery for Pie overlay nodes.
//!
//! This crate provides:
//! - [`Tracker`]: a remote peer with lazily established, shared session
//! - [`RoutingTable`]: known trackers indexed by identifier, recency and
//!   bit trie, answering nearest-neighbour queries
//! - Bootstrap from seed trackers and the iterative `find_tracker` lookup
//! - [`Responder`]: the answering side of lookups and identity announcements
//!
//! ## Example
//!
//! ```no_run
//! use pie_core::{Certificate, Context, Id};
//! use pie_discovery::{DiscoveryConfig, RoutingTable, Tracker};
//! use pie_transport::QuicConnector;
//! use std::sync::Arc;
//!
//! # async fn example() -> pie_core::Result<()> {
//! let cert = Arc::new(Certificate::generate()?.certificate);
//! let config = DiscoveryConfig::default().with_local_id(cert.id());
//! let connector = Arc::new(QuicConnector::bind_client()?);
//! let table = Arc::new(RoutingTable::new(connector, config.clone(), Some(cert)));
//!
//! let ctx = Context::background();
//! let seed = Arc::new(Tracker::unknown(vec!["192.0.2.1:4433".to_string()]));
//! table.bootstrap(&ctx, vec![seed]).await;
//! let outcome = table
//!     .find_tracker(&ctx, &Id::random(), config.fanout, config.request_timeout)
//!     .await?;
//! println!("visited {} trackers", outcome.visited.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod responder;
pub mod table;
pub mod tracker;

pub use config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DiscoveryConfig};
pub use discovery::FindOutcome;
pub use responder::{ClientIdentity, Responder};
pub use table::RoutingTable;
pub use tracker::Tracker;

//! In-process transport.
//!
//! A [`MemoryNetwork`] is a registry of listening addresses. Connections
//! between a [`MemoryConnector`] and a [`MemoryListener`] carry streams over
//! `tokio::io::duplex` pipes, with the same semantics the session layer
//! relies on from QUIC: ordered streams, peer certificates, protocol
//! negotiation, certificate pinning and close propagation.

use crate::transport::{ConnectOptions, Connection, Connector, Listener, RawStream};
use async_trait::async_trait;
use pie_core::{Error, Protocol, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};

/// Buffer size of each direction of an in-memory stream
const PIPE_CAPACITY: usize = 64 * 1024;

struct Registration {
    cert_der: Vec<u8>,
    incoming: mpsc::UnboundedSender<Arc<dyn Connection>>,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, Registration>,
    next_port: u64,
}

/// Shared registry of in-memory listeners
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
    next_client: Arc<AtomicU64>,
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `addr` presenting `cert_der`
    ///
    /// An address ending in `:0` is replaced by a fresh unique port, as is
    /// an address that is already taken.
    pub fn listen(&self, addr: &str, cert_der: Vec<u8>) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);

        let mut bound = addr.to_string();
        if bound.ends_with(":0") || registry.listeners.contains_key(&bound) {
            let host = bound.rsplit_once(':').map_or(bound.as_str(), |(host, _)| host).to_string();
            loop {
                registry.next_port += 1;
                bound = format!("{host}:{}", 40_000 + registry.next_port);
                if !registry.listeners.contains_key(&bound) {
                    break;
                }
            }
            tracing::debug!("Address {} unavailable, bound {}", addr, bound);
        }
        registry.listeners.insert(
            bound.clone(),
            Registration {
                cert_der,
                incoming: tx,
            },
        );

        let (closed, _) = watch::channel(false);
        MemoryListener {
            network: self.clone(),
            addr: bound,
            incoming: tokio::sync::Mutex::new(rx),
            closed,
        }
    }

    /// A connector dialing into this network
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    /// Returns true if something listens on `addr`
    #[must_use]
    pub fn is_listening(&self, addr: &str) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .contains_key(addr)
    }

    fn unregister(&self, addr: &str) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .remove(addr);
    }
}

/// Dials [`MemoryListener`]s registered on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: &str, options: &ConnectOptions) -> Result<Arc<dyn Connection>> {
        let (cert_der, incoming) = {
            let registry = self
                .network
                .registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let registration = registry.listeners.get(addr).ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("nothing listening on {addr}"),
                ))
            })?;
            (registration.cert_der.clone(), registration.incoming.clone())
        };

        if let Some(pinned) = &options.pinned_server_cert {
            if *pinned != cert_der {
                return Err(Error::Unknown("server certificate mismatch".to_string()));
            }
        }

        let client_addr = format!(
            "mem-client-{}",
            self.network.next_client.fetch_add(1, Ordering::Relaxed)
        );
        let (client, server) =
            MemoryConnection::pair(options.protocol, cert_der, addr.to_string(), client_addr);
        incoming.send(server).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("listener on {addr} is gone"),
            ))
        })?;
        Ok(client)
    }
}

/// Accepts in-memory connections on one address
pub struct MemoryListener {
    network: MemoryNetwork,
    addr: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn Connection>>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::Closed("listener closed".to_string()));
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            conn = incoming.recv() => conn.ok_or_else(|| Error::Closed("listener closed".to_string())),
            _ = closed.wait_for(|closed| *closed) => Err(Error::Closed("listener closed".to_string())),
        }
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    fn close(&self) {
        self.network.unregister(&self.addr);
        self.closed.send_replace(true);
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unregister(&self.addr);
    }
}

/// One side of an in-memory connection
pub struct MemoryConnection {
    protocol: Protocol,
    peer_cert: Option<Vec<u8>>,
    remote: String,
    outgoing: mpsc::UnboundedSender<RawStream>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawStream>>,
    next_stream: Arc<AtomicU64>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryConnection {
    fn pair(
        protocol: Protocol,
        server_cert: Vec<u8>,
        server_addr: String,
        client_addr: String,
    ) -> (Arc<dyn Connection>, Arc<dyn Connection>) {
        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let next_stream = Arc::new(AtomicU64::new(0));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let client = Self {
            protocol,
            peer_cert: Some(server_cert),
            remote: server_addr,
            outgoing: to_server,
            incoming: tokio::sync::Mutex::new(client_rx),
            next_stream: next_stream.clone(),
            closed: closed.clone(),
        };
        let server = Self {
            protocol,
            peer_cert: None,
            remote: client_addr,
            outgoing: to_client,
            incoming: tokio::sync::Mutex::new(server_rx),
            next_stream,
            closed,
        };
        (Arc::new(client), Arc::new(server))
    }

    fn closed_error() -> Error {
        Error::Closed("connection closed".to_string())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_bi(&self) -> Result<RawStream> {
        if *self.closed.borrow() {
            return Err(Self::closed_error());
        }
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (local_recv, local_send) = tokio::io::split(local);
        let (remote_recv, remote_send) = tokio::io::split(remote);

        self.outgoing
            .send(RawStream {
                id,
                send: Box::new(remote_send),
                recv: Box::new(remote_recv),
            })
            .map_err(|_| Self::closed_error())?;
        Ok(RawStream {
            id,
            send: Box::new(local_send),
            recv: Box::new(local_recv),
        })
    }

    async fn accept_bi(&self) -> Result<RawStream> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Self::closed_error());
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream.ok_or_else(Self::closed_error),
            _ = closed.wait_for(|closed| *closed) => Err(Self::closed_error()),
        }
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_cert.clone()
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    fn close(&self, code: u32) {
        tracing::debug!("Closing connection to {} with code {}", self.remote, code);
        self.closed.send_replace(true);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

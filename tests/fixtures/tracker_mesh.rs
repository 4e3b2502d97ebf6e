//! In-memory tracker mesh fixture
//!
//! Spawns tracker nodes on one [`MemoryNetwork`], each with its own
//! routing table and a [`Responder`] serving incoming sessions. Tests wire
//! the nodes' tables together and run lookups from a separate client table.
//!
//! # Example
//!
//! ```no_run
//! use pie_integration_tests::fixtures::TrackerMesh;
//!
//! # async fn example() {
//! let mesh = TrackerMesh::new(4);
//! mesh.link_chain();
//! let (client, _) = mesh.client();
//! client.insert(mesh.seed(0));
//! // ... run lookups ...
//! mesh.shutdown().await;
//! # }
//! ```

use pie_core::{CancelHandle, Certificate, Context, Id};
use pie_discovery::{ClientIdentity, DiscoveryConfig, Responder, RoutingTable, Tracker};
use pie_transport::{Listener, MemoryNetwork, Server};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One tracker node of the mesh
pub struct TrackerNode {
    /// Node identifier
    pub id: Id,
    /// Listening address on the mesh network
    pub addr: String,
    /// The node's own routing table
    pub table: Arc<RoutingTable>,
    /// Identities verified by the node's responder
    pub identities: mpsc::UnboundedReceiver<ClientIdentity>,
    cancel: CancelHandle,
    serving: JoinHandle<()>,
}

impl TrackerNode {
    /// A tracker handle pointing at this node
    #[must_use]
    pub fn as_tracker(&self) -> Arc<Tracker> {
        Arc::new(Tracker::new(self.id, vec![self.addr.clone()]))
    }
}

/// A set of in-memory tracker nodes
pub struct TrackerMesh {
    /// Network the nodes listen on
    pub network: MemoryNetwork,
    /// Nodes in creation order
    pub nodes: Vec<TrackerNode>,
}

impl TrackerMesh {
    /// Spawn `count` tracker nodes with empty tables
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(count: usize) -> Self {
        let network = MemoryNetwork::new();
        let nodes = (0..count)
            .map(|i| spawn_node(&network, &format!("tracker{i}:4433"), DiscoveryConfig::default()))
            .collect();
        Self { network, nodes }
    }

    /// Let node `i` know node `i + 1`
    pub fn link_chain(&self) {
        for pair in self.nodes.windows(2) {
            pair[0].table.insert(pair[1].as_tracker());
        }
    }

    /// Let node `hub` know every other node
    pub fn link_star(&self, hub: usize) {
        for (i, node) in self.nodes.iter().enumerate() {
            if i != hub {
                self.nodes[hub].table.insert(node.as_tracker());
            }
        }
    }

    /// Tracker handle for node `i`
    #[must_use]
    pub fn seed(&self, i: usize) -> Arc<Tracker> {
        self.nodes[i].as_tracker()
    }

    /// Identifiers of all nodes
    #[must_use]
    pub fn ids(&self) -> Vec<Id> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// A client routing table on the mesh network with a fresh identity
    #[must_use]
    pub fn client(&self) -> (Arc<RoutingTable>, Arc<Certificate>) {
        self.client_with(DiscoveryConfig::default())
    }

    /// A client routing table using `config`, with its local id filled in
    #[must_use]
    pub fn client_with(&self, config: DiscoveryConfig) -> (Arc<RoutingTable>, Arc<Certificate>) {
        let cert = new_cert();
        let config = config.with_local_id(cert.id());
        let table = Arc::new(RoutingTable::new(
            Arc::new(self.network.connector()),
            config,
            Some(Arc::clone(&cert)),
        ));
        (table, cert)
    }

    /// Stop every node and wait for its responder to finish
    pub async fn shutdown(self) {
        for node in self.nodes {
            node.cancel.cancel();
            if let Err(e) = node.serving.await {
                tracing::warn!("Tracker node task failed: {}", e);
            }
        }
    }
}

fn new_cert() -> Arc<Certificate> {
    match Certificate::generate() {
        Ok(generated) => Arc::new(generated.certificate),
        Err(e) => panic!("certificate generation failed: {e}"),
    }
}

fn spawn_node(network: &MemoryNetwork, addr: &str, config: DiscoveryConfig) -> TrackerNode {
    let cert = new_cert();
    let listener = network.listen(addr, cert.der().to_vec());
    let addr = listener.local_addr();
    let server = Arc::new(Server::new(Arc::new(listener), cert.der().to_vec()));

    let table = Arc::new(RoutingTable::new(
        Arc::new(network.connector()),
        config.with_local_id(cert.id()),
        Some(Arc::clone(&cert)),
    ));
    let (tx, identities) = mpsc::unbounded_channel();
    let responder = Arc::new(Responder::new(Arc::clone(&table), server).with_identity_sink(tx));
    let (ctx, cancel) = Context::with_cancel();
    let serving = tokio::spawn(async move { responder.serve(&ctx).await });

    TrackerNode {
        id: cert.id(),
        addr,
        table,
        identities,
        cancel,
        serving,
    }
}

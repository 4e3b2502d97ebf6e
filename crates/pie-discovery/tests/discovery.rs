//! Lookup and bootstrap against in-memory tracker nodes

use pie_core::{CancelHandle, Certificate, Context, Error, Id};
use pie_discovery::{DiscoveryConfig, Responder, RoutingTable, Tracker};
use pie_transport::{Listener, MemoryNetwork, Server};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

struct Node {
    id: Id,
    addr: String,
    table: Arc<RoutingTable>,
    cancel: CancelHandle,
    serving: JoinHandle<()>,
}

impl Node {
    fn spawn(network: &MemoryNetwork, name: &str) -> Self {
        let cert = Arc::new(Certificate::generate().unwrap().certificate);
        let listener = network.listen(&format!("{name}:4433"), cert.der().to_vec());
        let addr = listener.local_addr();
        let server = Arc::new(Server::new(Arc::new(listener), cert.der().to_vec()));

        let table = table_for(network, &cert);
        let responder = Arc::new(Responder::new(Arc::clone(&table), server));
        let (ctx, cancel) = Context::with_cancel();
        let serving = tokio::spawn(async move { responder.serve(&ctx).await });

        Self {
            id: cert.id(),
            addr,
            table,
            cancel,
            serving,
        }
    }

    fn as_seed(&self) -> Arc<Tracker> {
        Arc::new(Tracker::new(self.id, vec![self.addr.clone()]))
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.serving.await.unwrap();
    }
}

fn table_for(network: &MemoryNetwork, cert: &Arc<Certificate>) -> Arc<RoutingTable> {
    let config = DiscoveryConfig::default().with_local_id(cert.id());
    Arc::new(RoutingTable::new(
        Arc::new(network.connector()),
        config,
        Some(Arc::clone(cert)),
    ))
}

fn client(network: &MemoryNetwork) -> (Arc<RoutingTable>, Id) {
    let cert = Arc::new(Certificate::generate().unwrap().certificate);
    (table_for(network, &cert), cert.id())
}

#[tokio::test]
async fn test_lookup_terminates_on_isolated_tracker() {
    let network = MemoryNetwork::new();
    let tracker = Node::spawn(&network, "lonely");
    let (table, _) = client(&network);
    table.insert(tracker.as_seed());

    let outcome = table
        .find_tracker(&Context::background(), &Id::random(), 3, REQUEST_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.visited, HashSet::from([tracker.id]));
    assert_eq!(outcome.rounds, 1);
    assert_eq!(table.ids(), vec![tracker.id]);
    tracker.stop().await;
}

#[tokio::test]
async fn test_lookup_follows_referrals() {
    let network = MemoryNetwork::new();
    let near = Node::spawn(&network, "near");
    let far = Node::spawn(&network, "far");
    near.table.insert(far.as_seed());

    let (table, _) = client(&network);
    table.insert(near.as_seed());

    let outcome = table
        .find_tracker(&Context::background(), &far.id, 3, REQUEST_TIMEOUT)
        .await
        .unwrap();

    assert!(table.contains(&far.id));
    assert!(table.get(&far.id).unwrap().is_live());
    assert_eq!(outcome.visited, HashSet::from([near.id, far.id]));
    assert_eq!(outcome.rounds, 2);
    table.check_consistency().unwrap();

    near.stop().await;
    far.stop().await;
}

#[tokio::test]
async fn test_lookup_skips_unreachable_referral() {
    let network = MemoryNetwork::new();
    let near = Node::spawn(&network, "near");
    let ghost = Id::random();
    near.table
        .insert(Arc::new(Tracker::new(ghost, vec!["ghost:4433".to_string()])));

    let (table, _) = client(&network);
    table.insert(near.as_seed());

    let outcome = table
        .find_tracker(&Context::background(), &ghost, 3, REQUEST_TIMEOUT)
        .await
        .unwrap();

    assert!(!table.contains(&ghost));
    assert_eq!(outcome.visited, HashSet::from([near.id]));
    near.stop().await;
}

#[tokio::test]
async fn test_lookup_removes_unreachable_trackers() {
    let network = MemoryNetwork::new();
    let live = Node::spawn(&network, "live");
    let stopped = Node::spawn(&network, "stopped");
    let stopped_seed = stopped.as_seed();
    stopped.stop().await;

    let (table, _) = client(&network);
    let dead = Id::random();
    table.insert(Arc::new(Tracker::new(dead, vec!["nowhere:1".to_string()])));
    table.insert(stopped_seed.clone());
    table.insert(live.as_seed());

    let outcome = table
        .find_tracker(&Context::background(), &dead, 3, REQUEST_TIMEOUT)
        .await
        .unwrap();

    assert!(!table.contains(&dead));
    assert!(!table.contains(&stopped_seed.id()));
    assert_eq!(table.ids(), vec![live.id]);
    assert!(outcome.visited.contains(&dead));
    table.check_consistency().unwrap();
    live.stop().await;
}

#[tokio::test]
async fn test_lookup_does_not_insert_self() {
    let network = MemoryNetwork::new();
    let a = Node::spawn(&network, "a");
    let b = Node::spawn(&network, "b");
    a.table.insert(b.as_seed());
    b.table.insert(a.as_seed());

    let outcome = a
        .table
        .find_tracker(&Context::background(), &a.id, 3, REQUEST_TIMEOUT)
        .await
        .unwrap();

    assert!(!a.table.contains(&a.id));
    assert_eq!(outcome.visited, HashSet::from([b.id]));
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_lookup_canceled() {
    let network = MemoryNetwork::new();
    let (table, _) = client(&network);
    let (ctx, handle) = Context::with_cancel();
    handle.cancel();

    let err = table
        .find_tracker(&ctx, &Id::random(), 3, REQUEST_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled));
}

#[tokio::test]
async fn test_bootstrap_keeps_only_reachable_seeds() {
    let network = MemoryNetwork::new();
    let nodes: Vec<Node> = (0..3)
        .map(|i| Node::spawn(&network, &format!("seed{i}")))
        .collect();

    let mut seeds: Vec<Arc<Tracker>> = Vec::new();
    seeds.push(nodes[0].as_seed());
    seeds.push(nodes[1].as_seed());
    // Identifier learned from the certificate on first contact
    seeds.push(Arc::new(Tracker::unknown(vec![nodes[2].addr.clone()])));
    seeds.push(Arc::new(Tracker::new(
        Id::random(),
        vec!["dead1:4433".to_string()],
    )));
    seeds.push(Arc::new(Tracker::unknown(vec!["dead2:4433".to_string()])));

    let (table, _) = client(&network);
    let connected = table.bootstrap(&Context::background(), seeds).await;

    assert_eq!(connected, 3);
    assert_eq!(table.len(), 3);
    let ids: HashSet<Id> = table.ids().into_iter().collect();
    assert_eq!(ids, nodes.iter().map(|n| n.id).collect());
    assert!(table.trackers().iter().all(|t| t.is_live()));
    table.check_consistency().unwrap();

    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_bootstrap_rejects_wrong_identity() {
    let network = MemoryNetwork::new();
    let node = Node::spawn(&network, "impostor");
    let (table, _) = client(&network);

    let seed = Arc::new(Tracker::new(Id::random(), vec![node.addr.clone()]));
    let connected = table.bootstrap(&Context::background(), vec![seed]).await;

    assert_eq!(connected, 0);
    assert!(table.is_empty());
    node.stop().await;
}

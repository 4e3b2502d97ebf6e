//! Routing table of known trackers.
//!
//! Three views of the same set of trackers are kept behind one lock:
//!
//! ```text
//!   map:  Id ──────────▶ seq
//!   list: seq ─────────▶ Arc<Tracker>      (higher seq = more recent)
//!   trie:        root
//!               /    \
//!             0        1                   bit 0 (MSB of byte 0)
//!            / \        \
//!          ...  ...     ...                one level per identifier bit
//!                         \
//!                        leaf ─▶ Arc<Tracker>
//! ```
//!
//! Every identifier in the map has exactly one list entry and exactly one
//! trie leaf. Removal prunes trie branches left without leaves, so every
//! interior node except the root has at least one child.
//!
//! [`RoutingTable::nearest`] walks the trie depth first, at every level
//! trying the child that agrees with the target's bit before its sibling.
//! Leaves are therefore visited in increasing XOR distance from the target.

use crate::config::DiscoveryConfig;
use crate::tracker::Tracker;
use pie_core::{Certificate, Context, Error, ID_BITS, Id, Result};
use pie_transport::{ConnectOptions, Connector, Session};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinSet;

#[derive(Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    value: Option<Arc<Tracker>>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.iter().all(Option::is_none)
    }

    fn insert(&mut self, id: &Id, tracker: Arc<Tracker>) {
        let mut node = self;
        for depth in 0..ID_BITS {
            node = node.children[id.bit(depth)].get_or_insert_with(Box::default);
        }
        node.value = Some(tracker);
    }

    /// Clear the leaf for `id`, returning true if this node became empty
    fn remove(&mut self, id: &Id, depth: usize) -> bool {
        if depth == ID_BITS {
            self.value = None;
            return true;
        }
        let bit = id.bit(depth);
        if let Some(child) = self.children[bit].as_mut() {
            if child.remove(id, depth + 1) {
                self.children[bit] = None;
            }
        }
        self.is_empty()
    }

    fn nearest(
        &self,
        depth: usize,
        target: &Id,
        count: usize,
        exclude: Option<&Id>,
        out: &mut Vec<Arc<Tracker>>,
    ) {
        if out.len() == count {
            return;
        }
        if let Some(tracker) = &self.value {
            if exclude != Some(&tracker.id()) {
                out.push(tracker.clone());
            }
            return;
        }
        if depth == ID_BITS {
            return;
        }
        let bit = target.bit(depth);
        for side in [bit, 1 - bit] {
            if let Some(child) = &self.children[side] {
                child.nearest(depth + 1, target, count, exclude, out);
            }
        }
    }

    fn collect_leaves(&self, depth: usize, path: &mut [u8; pie_core::ID_LEN], out: &mut Vec<Id>) -> std::result::Result<(), String> {
        if depth == ID_BITS {
            let tracker = self
                .value
                .as_ref()
                .ok_or_else(|| "trie leaf without a tracker".to_string())?;
            let id = Id::from_bytes(*path);
            if tracker.id() != id {
                return Err(format!("leaf at {id} holds tracker {}", tracker.id()));
            }
            out.push(id);
            return Ok(());
        }
        if self.value.is_some() {
            return Err(format!("interior node at depth {depth} holds a tracker"));
        }
        if depth > 0 && self.is_empty() {
            return Err(format!("unpruned empty node at depth {depth}"));
        }
        let mask = 0x80u8 >> (depth % 8);
        for side in 0..2 {
            if let Some(child) = &self.children[side] {
                if side == 1 {
                    path[depth / 8] |= mask;
                } else {
                    path[depth / 8] &= !mask;
                }
                child.collect_leaves(depth + 1, path, out)?;
            }
        }
        path[depth / 8] &= !mask;
        Ok(())
    }
}

#[derive(Default)]
struct Views {
    map: HashMap<Id, u64>,
    list: BTreeMap<u64, Arc<Tracker>>,
    trie: TrieNode,
    next_seq: u64,
}

impl Views {
    fn remove(&mut self, id: &Id) -> Option<Arc<Tracker>> {
        let seq = self.map.remove(id)?;
        let tracker = self.list.remove(&seq);
        self.trie.remove(id, 0);
        tracker
    }
}

/// Concurrent index of known trackers
pub struct RoutingTable {
    views: RwLock<Views>,
    connector: Arc<dyn Connector>,
    config: DiscoveryConfig,
    cert: Option<Arc<Certificate>>,
}

impl RoutingTable {
    /// Create an empty table
    ///
    /// `cert` is the local identity announced when connecting on the
    /// tracker protocol.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        config: DiscoveryConfig,
        cert: Option<Arc<Certificate>>,
    ) -> Self {
        Self {
            views: RwLock::new(Views::default()),
            connector,
            config,
            cert,
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Local node identifier, if configured
    #[must_use]
    pub fn local_id(&self) -> Option<Id> {
        self.config.local_id
    }

    /// Insert a tracker, replacing any tracker with the same identifier
    ///
    /// The new tracker takes over the recency position of the one it
    /// replaces. A replaced tracker is disconnected and returned.
    /// Trackers with an unknown identifier are not inserted.
    pub fn insert(&self, tracker: Arc<Tracker>) -> Option<Arc<Tracker>> {
        let id = tracker.id();
        if id.is_zero() {
            tracing::warn!("Refusing to insert tracker with unknown id at {:?}", tracker.addr());
            return None;
        }

        let replaced = {
            let mut views = self.write();
            views.trie.insert(&id, tracker.clone());
            match views.map.get(&id).copied() {
                Some(seq) => views.list.insert(seq, tracker.clone()),
                None => {
                    let seq = views.next_seq;
                    views.next_seq += 1;
                    views.list.insert(seq, tracker.clone());
                    views.map.insert(id, seq);
                    None
                }
            }
        };
        if let Some(old) = &replaced {
            if !Arc::ptr_eq(old, &tracker) {
                tracing::debug!("Replaced tracker {:?}", id);
                old.disconnect();
            }
        }
        replaced
    }

    /// Insert a tracker unless its identifier is already present
    ///
    /// Returns true if the tracker was inserted.
    pub fn insert_if_absent(&self, tracker: Arc<Tracker>) -> bool {
        let id = tracker.id();
        if id.is_zero() {
            return false;
        }
        let mut views = self.write();
        if views.map.contains_key(&id) {
            return false;
        }
        let seq = views.next_seq;
        views.next_seq += 1;
        views.trie.insert(&id, tracker.clone());
        views.list.insert(seq, tracker);
        views.map.insert(id, seq);
        true
    }

    /// Remove the tracker with `id` and close its session
    ///
    /// Removing an absent identifier does nothing.
    pub fn remove(&self, id: &Id) -> Option<Arc<Tracker>> {
        let removed = self.write().remove(id);
        if let Some(tracker) = &removed {
            tracing::debug!("Removed tracker {:?}", id);
            tracker.disconnect();
        }
        removed
    }

    /// Remove `tracker` only if it is still the entry for its identifier
    pub fn remove_if_same(&self, tracker: &Arc<Tracker>) -> bool {
        let id = tracker.id();
        let removed = {
            let mut views = self.write();
            let same = views
                .map
                .get(&id)
                .and_then(|seq| views.list.get(seq))
                .is_some_and(|current| Arc::ptr_eq(current, tracker));
            if same { views.remove(&id) } else { None }
        };
        match removed {
            Some(tracker) => {
                tracing::debug!("Removed tracker {:?}", id);
                tracker.disconnect();
                true
            }
            None => false,
        }
    }

    /// Exact lookup
    #[must_use]
    pub fn get(&self, id: &Id) -> Option<Arc<Tracker>> {
        let views = self.read();
        views.map.get(id).and_then(|seq| views.list.get(seq)).cloned()
    }

    /// Returns true if a tracker with `id` is present
    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        self.read().map.contains_key(id)
    }

    /// Up to `count` trackers nearest to `target`, nearest first
    ///
    /// `exclude` is skipped if present. The table lock is held for the
    /// whole traversal.
    #[must_use]
    pub fn nearest(&self, target: &Id, count: usize, exclude: Option<&Id>) -> Vec<Arc<Tracker>> {
        let mut out = Vec::with_capacity(count.min(64));
        if count == 0 {
            return out;
        }
        self.read().trie.nearest(0, target, count, exclude, &mut out);
        out
    }

    /// Number of trackers
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().map.len()
    }

    /// Returns true if the table holds no tracker
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All trackers, most recently inserted first
    #[must_use]
    pub fn trackers(&self) -> Vec<Arc<Tracker>> {
        self.read().list.values().rev().cloned().collect()
    }

    /// All identifiers, most recently inserted first
    #[must_use]
    pub fn ids(&self) -> Vec<Id> {
        self.read().list.values().rev().map(|t| t.id()).collect()
    }

    /// Verify that map, list and trie hold the same trackers
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        let views = self.read();
        if views.map.len() != views.list.len() {
            return Err(format!(
                "map has {} entries, list has {}",
                views.map.len(),
                views.list.len()
            ));
        }
        for (id, seq) in &views.map {
            let tracker = views
                .list
                .get(seq)
                .ok_or_else(|| format!("map entry {id} points at missing list entry {seq}"))?;
            if tracker.id() != *id {
                return Err(format!("map entry {id} points at tracker {}", tracker.id()));
            }
        }

        let mut leaves = Vec::new();
        let mut path = [0u8; pie_core::ID_LEN];
        views.trie.collect_leaves(0, &mut path, &mut leaves)?;
        let leaf_set: HashSet<Id> = leaves.iter().copied().collect();
        if leaves.len() != views.map.len() || leaf_set.len() != leaves.len() {
            return Err(format!(
                "trie has {} leaves, map has {} entries",
                leaves.len(),
                views.map.len()
            ));
        }
        match leaf_set.iter().find(|id| !views.map.contains_key(id)) {
            Some(id) => Err(format!("trie leaf {id} missing from map")),
            None => Ok(()),
        }
    }

    /// Connect to `tracker` with this table's connector and identity
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] when the connect timeout elapses, or the
    /// error from [`Tracker::connect`].
    pub async fn connect_tracker(&self, ctx: &Context, tracker: &Tracker) -> Result<Session> {
        let options = ConnectOptions::new(self.config.protocol);
        let connect = tracker.connect(ctx, self.connector.as_ref(), &options, self.cert.as_deref());
        tokio::time::timeout(self.config.connect_timeout, connect).await?
    }

    /// Insert `tracker`, then connect to it
    ///
    /// The tracker is removed again if the connection fails.
    ///
    /// # Errors
    ///
    /// Returns the connection error.
    pub async fn insert_and_connect(&self, ctx: &Context, tracker: Arc<Tracker>) -> Result<()> {
        self.insert(tracker.clone());
        self.connect_inserted(ctx, &tracker).await
    }

    pub(crate) async fn connect_inserted(&self, ctx: &Context, tracker: &Arc<Tracker>) -> Result<()> {
        match self.connect_tracker(ctx, tracker).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if !e.is_expected() {
                    tracing::warn!("Failed to connect to tracker {:?}: {}", tracker.id(), e);
                }
                self.remove_if_same(tracker);
                Err(e)
            }
        }
    }

    /// Populate the table from seed trackers
    ///
    /// Seeds with a known identifier are inserted and connected; seeds with
    /// an unknown identifier are connected first and inserted once their
    /// certificate has revealed the identifier. All attempts run
    /// concurrently and are joined before returning. Seeds that fail to
    /// connect are not left in the table.
    ///
    /// Returns the number of seeds connected.
    pub async fn bootstrap(self: &Arc<Self>, ctx: &Context, seeds: Vec<Arc<Tracker>>) -> usize {
        if seeds.is_empty() {
            tracing::info!("No bootstrap trackers, waiting for other trackers to join");
            return 0;
        }

        let mut tasks = JoinSet::new();
        for seed in seeds {
            let table = Arc::clone(self);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                if seed.id().is_zero() {
                    tracing::info!("Connecting to tracker at {:?}", seed.addr());
                    table.connect_tracker(&ctx, &seed).await?;
                    if table.local_id() == Some(seed.id()) {
                        seed.disconnect();
                        return Err(Error::InvalidConfig("seed is the local node".to_string()));
                    }
                    table.insert(seed);
                    Ok(())
                } else if table.local_id() == Some(seed.id()) {
                    Err(Error::InvalidConfig("seed is the local node".to_string()))
                } else {
                    table.insert_and_connect(&ctx, seed).await
                }
            });
        }

        let mut connected = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => connected += 1,
                Ok(Err(e)) => tracing::debug!("Bootstrap tracker failed: {}", e),
                Err(e) => tracing::warn!("Bootstrap task failed: {}", e),
            }
        }
        tracing::info!("Bootstrap connected {} trackers", connected);
        connected
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Views> {
        self.views.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Views> {
        self.views.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pie_core::ID_LEN;
    use pie_transport::{Listener, MemoryNetwork};
    use proptest::prelude::*;

    fn empty_table() -> RoutingTable {
        let network = MemoryNetwork::new();
        RoutingTable::new(Arc::new(network.connector()), DiscoveryConfig::default(), None)
    }

    fn id_with_first_byte(b: u8) -> Id {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = b;
        bytes[ID_LEN - 1] = 1;
        Id::from_bytes(bytes)
    }

    fn tracker(id: Id) -> Arc<Tracker> {
        Arc::new(Tracker::new(id, vec![format!("{id}:1")]))
    }

    #[test]
    fn test_insert_get_remove() {
        let table = empty_table();
        let a = id_with_first_byte(0x10);
        let b = id_with_first_byte(0x20);
        table.insert(tracker(a));
        table.insert(tracker(b));

        assert_eq!(table.len(), 2);
        assert!(table.contains(&a));
        assert_eq!(table.get(&b).unwrap().id(), b);
        assert_eq!(table.ids(), vec![b, a]);

        assert!(table.remove(&a).is_some());
        assert!(!table.contains(&a));
        assert!(table.get(&a).is_none());
        assert_eq!(table.len(), 1);
        table.check_consistency().unwrap();

        table.remove(&b);
        assert!(table.is_empty());
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_reinsert_overwrites_in_place() {
        let table = empty_table();
        let a = id_with_first_byte(1);
        let b = id_with_first_byte(2);
        let first = tracker(a);
        table.insert(first.clone());
        table.insert(tracker(b));

        let second = tracker(a);
        let replaced = table.insert(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(table.len(), 2);
        assert_eq!(table.ids(), vec![b, a]);
        assert!(Arc::ptr_eq(&table.get(&a).unwrap(), &second));
        assert!(Arc::ptr_eq(&table.nearest(&a, 1, None)[0], &second));
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_insert_if_absent() {
        let table = empty_table();
        let a = id_with_first_byte(1);
        let first = tracker(a);
        assert!(table.insert_if_absent(first.clone()));
        assert!(!table.insert_if_absent(tracker(a)));
        assert!(Arc::ptr_eq(&table.get(&a).unwrap(), &first));
    }

    #[test]
    fn test_unknown_id_not_inserted() {
        let table = empty_table();
        table.insert(Arc::new(Tracker::unknown(vec!["x:1".to_string()])));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_if_same_ignores_stale() {
        let table = empty_table();
        let a = id_with_first_byte(7);
        let stale = tracker(a);
        table.insert(stale.clone());
        let fresh = tracker(a);
        table.insert(fresh.clone());

        assert!(!table.remove_if_same(&stale));
        assert!(table.contains(&a));
        assert!(table.remove_if_same(&fresh));
        assert!(!table.contains(&a));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let table = empty_table();
        let a = id_with_first_byte(0x80);
        table.insert(tracker(a));
        let before = table.ids();

        assert!(table.remove(&id_with_first_byte(0x81)).is_none());
        assert!(table.remove(&id_with_first_byte(0x01)).is_none());
        assert_eq!(table.ids(), before);
        table.check_consistency().unwrap();
    }

    #[test]
    fn test_nearest_prefers_matching_bits() {
        let table = empty_table();
        for b in [0b0000_0000u8, 0b0100_0000, 0b1000_0000, 0b1100_0000] {
            table.insert(tracker(id_with_first_byte(b)));
        }
        let target = id_with_first_byte(0b1100_0000);

        let nearest: Vec<Id> = table.nearest(&target, 4, None).iter().map(|t| t.id()).collect();
        assert_eq!(
            nearest,
            vec![
                id_with_first_byte(0b1100_0000),
                id_with_first_byte(0b1000_0000),
                id_with_first_byte(0b0100_0000),
                id_with_first_byte(0b0000_0000),
            ]
        );

        let excluded: Vec<Id> = table
            .nearest(&target, 2, Some(&target))
            .iter()
            .map(|t| t.id())
            .collect();
        assert_eq!(
            excluded,
            vec![id_with_first_byte(0b1000_0000), id_with_first_byte(0b0100_0000)]
        );
        assert!(table.nearest(&target, 0, None).is_empty());
    }

    fn table_with_identity(network: &MemoryNetwork, cert: &Arc<Certificate>) -> Arc<RoutingTable> {
        Arc::new(RoutingTable::new(
            Arc::new(network.connector()),
            DiscoveryConfig::default().with_local_id(cert.id()),
            Some(Arc::clone(cert)),
        ))
    }

    #[tokio::test]
    async fn test_reinsert_disconnects_replaced_tracker() {
        let network = MemoryNetwork::new();
        let remote = Certificate::generate().unwrap().certificate;
        let listener = network.listen("remote:1", remote.der().to_vec());
        let local = Arc::new(Certificate::generate().unwrap().certificate);
        let table = table_with_identity(&network, &local);

        let first = Arc::new(Tracker::new(remote.id(), vec![listener.local_addr()]));
        table.insert(first.clone());
        table.connect_tracker(&Context::background(), &first).await.unwrap();
        assert!(first.is_live());

        // Re-inserting the same tracker keeps its session
        assert!(Arc::ptr_eq(&table.insert(first.clone()).unwrap(), &first));
        assert!(first.is_live());

        let second = Arc::new(Tracker::new(remote.id(), vec![listener.local_addr()]));
        let replaced = table.insert(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(!first.is_live());
        assert!(first.session().is_none());
        assert!(Arc::ptr_eq(&table.get(&remote.id()).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_bootstrap_skips_local_id() {
        let network = MemoryNetwork::new();
        let local = Arc::new(Certificate::generate().unwrap().certificate);
        let listener = network.listen("self:1", local.der().to_vec());
        let table = table_with_identity(&network, &local);

        let seeds = vec![
            Arc::new(Tracker::new(local.id(), vec![listener.local_addr()])),
            Arc::new(Tracker::unknown(vec![listener.local_addr()])),
        ];
        assert_eq!(table.bootstrap(&Context::background(), seeds).await, 0);
        assert!(!table.contains(&local.id()));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_empty() {
        let table = Arc::new(empty_table());
        assert_eq!(table.bootstrap(&Context::background(), Vec::new()).await, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8),
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u8>().prop_map(Op::Insert), any::<u8>().prop_map(Op::Remove)]
    }

    fn small_id(seed: u8) -> Id {
        // Shared prefixes exercise deep branches and pruning
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = seed & 0xF0;
        bytes[ID_LEN - 1] = seed | 1;
        Id::from_bytes(bytes)
    }

    proptest! {
        #[test]
        fn prop_views_stay_consistent(ops in prop::collection::vec(op_strategy(), 1..64)) {
            let table = empty_table();
            let mut model = HashSet::new();
            for op in ops {
                match op {
                    Op::Insert(seed) => {
                        table.insert(tracker(small_id(seed)));
                        model.insert(small_id(seed));
                    }
                    Op::Remove(seed) => {
                        table.remove(&small_id(seed));
                        model.remove(&small_id(seed));
                    }
                }
                prop_assert!(table.check_consistency().is_ok(), "{:?}", table.check_consistency());
                let ids: HashSet<Id> = table.ids().into_iter().collect();
                prop_assert_eq!(&ids, &model);
            }
        }

        #[test]
        fn prop_nearest_bounds(
            seeds in prop::collection::hash_set(any::<u8>(), 0..32),
            target in any::<u8>(),
            count in 0usize..10,
            exclude_first in any::<bool>(),
        ) {
            let table = empty_table();
            for seed in &seeds {
                table.insert(tracker(small_id(*seed)));
            }
            let target = small_id(target);
            let exclude = seeds.iter().next().filter(|_| exclude_first).map(|s| small_id(*s));

            let result = table.nearest(&target, count, exclude.as_ref());
            prop_assert!(result.len() <= count);
            let ids: Vec<Id> = result.iter().map(|t| t.id()).collect();
            for id in &ids {
                prop_assert!(table.contains(id));
                prop_assert!(Some(*id) != exclude);
            }
            let distances: Vec<Id> = ids.iter().map(|id| id.distance(&target)).collect();
            prop_assert!(distances.windows(2).all(|w| w[0] < w[1]));

            let available = table.len() - usize::from(exclude.is_some());
            prop_assert_eq!(ids.len(), count.min(available));
        }
    }
}

use super::peer::{CapabilityFilter, PeerInfo};
use super::routing_table::{Insert, RoutingTable};
use crate::zfx_id::Id;
use crate::Result;

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::debug;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Asks a remote node for the peers it knows closest to a target. The answer may include
/// the remote node's own, current description.
pub trait NodeQuery: Send + Sync {
    fn find_nodes(&self, peer: PeerInfo, target: Id) -> BoxFuture<'static, Result<Vec<PeerInfo>>>;
}

/// The distributed lookup structure behind peer discovery.
pub trait Lookup: Send + Sync {
    /// Peers matching `filter`, in no particular order.
    fn lookup(&self, filter: CapabilityFilter) -> BoxFuture<'static, Result<Vec<PeerInfo>>>;

    /// Up to `count` locally known peers closest to `target`, without asking the network.
    fn closest(&self, target: &Id, count: usize) -> Vec<PeerInfo>;

    /// Adds or refreshes a peer. Resolves once a full bucket decided whether to keep its
    /// oldest peer or take the new one.
    fn observe(&self, peer: PeerInfo) -> BoxFuture<'static, ()>;

    fn forget(&self, id: &Id);
}

/// Kademlia style lookup over a [RoutingTable].
pub struct DhtLookup {
    table: Arc<Mutex<RoutingTable>>,
    query: Arc<dyn NodeQuery>,
    k: usize,
    alpha: usize,
}

fn lock(table: &Mutex<RoutingTable>) -> MutexGuard<'_, RoutingTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DhtLookup {
    pub fn new(local: Id, query: Arc<dyn NodeQuery>, k: usize, alpha: usize) -> Self {
        DhtLookup {
            table: Arc::new(Mutex::new(RoutingTable::with_bucket_size(local, k))),
            query,
            k: k.max(1),
            alpha: alpha.max(1),
        }
    }

    pub fn local(&self) -> Id {
        lock(&self.table).local()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converges on the `k` nodes closest to `target` that answered a query.
    pub fn find_node(&self, target: Id) -> BoxFuture<'static, Vec<PeerInfo>> {
        iterative_find_node(self.table.clone(), self.query.clone(), target, self.k, self.alpha).boxed()
    }
}

impl Lookup for DhtLookup {
    fn lookup(&self, filter: CapabilityFilter) -> BoxFuture<'static, Result<Vec<PeerInfo>>> {
        let table = self.table.clone();
        let search = self.find_node(filter.target(self.local()));
        async move {
            let mut found: HashMap<Id, PeerInfo> = HashMap::new();
            for peer in lock(&table).peers() {
                found.insert(peer.id, peer);
            }
            // Nodes that just answered carry their freshest self description.
            for peer in search.await {
                found.insert(peer.id, peer);
            }
            Ok(found.into_iter().map(|(_, p)| p).filter(|p| filter.matches(p)).collect())
        }
        .boxed()
    }

    fn closest(&self, target: &Id, count: usize) -> Vec<PeerInfo> {
        lock(&self.table).closest(target, count)
    }

    fn observe(&self, peer: PeerInfo) -> BoxFuture<'static, ()> {
        let result = lock(&self.table).insert(peer.clone());
        debug!("observed {:?}: {:?}", peer, result);
        match result {
            Insert::BucketFull { oldest } => {
                ping_then_evict(self.table.clone(), self.query.clone(), oldest, peer).boxed()
            }
            _ => async {}.boxed(),
        }
    }

    fn forget(&self, id: &Id) {
        let _ = lock(&self.table).remove(id);
    }
}

/// The oldest peer of a full bucket keeps its place while it still answers. Otherwise it
/// makes room for `newcomer`.
async fn ping_then_evict(
    table: Arc<Mutex<RoutingTable>>,
    query: Arc<dyn NodeQuery>,
    oldest: Id,
    newcomer: PeerInfo,
) {
    let known = lock(&table).get(&oldest).cloned();
    let oldest_peer = match known {
        Some(peer) => peer,
        None => {
            let _ = lock(&table).insert(newcomer);
            return;
        }
    };
    match query.find_nodes(oldest_peer.clone(), oldest).await {
        Ok(_) => {
            debug!("{} is alive, dropping {}", oldest, newcomer.id);
            let _ = lock(&table).insert(oldest_peer);
        }
        Err(err) => {
            debug!("evicting {} for {}: {:?}", oldest, newcomer.id, err);
            let _ = lock(&table).replace(&oldest, newcomer);
        }
    }
}

async fn iterative_find_node(
    table: Arc<Mutex<RoutingTable>>,
    query: Arc<dyn NodeQuery>,
    target: Id,
    k: usize,
    alpha: usize,
) -> Vec<PeerInfo> {
    let local = lock(&table).local();
    let mut known: HashMap<Id, PeerInfo> = HashMap::new();
    let mut candidates: BTreeSet<(Id, Id)> = BTreeSet::new();
    for peer in lock(&table).closest(&target, k) {
        candidates.insert((target.distance(&peer.id), peer.id));
        known.insert(peer.id, peer);
    }
    let mut queried: HashSet<Id> = HashSet::new();
    let mut responded: BTreeSet<(Id, Id)> = BTreeSet::new();

    loop {
        let batch: Vec<PeerInfo> = candidates
            .iter()
            .filter(|(_, id)| !queried.contains(id))
            .take(alpha)
            .filter_map(|(_, id)| known.get(id).cloned())
            .collect();
        if batch.is_empty() {
            break;
        }
        // Done once the best unqueried candidate cannot improve the k closest answers.
        if responded.len() >= k {
            let kth = responded.iter().nth(k - 1).map(|(distance, _)| *distance);
            if let Some(kth) = kth {
                if target.distance(&batch[0].id) >= kth {
                    break;
                }
            }
        }
        for peer in batch.iter() {
            let _ = queried.insert(peer.id);
        }

        let responses = join_all(batch.into_iter().map(|peer| {
            let query = query.clone();
            async move {
                let response = query.find_nodes(peer.clone(), target).await;
                (peer, response)
            }
        }))
        .await;

        for (peer, response) in responses {
            match response {
                Ok(nodes) => {
                    let _ = responded.insert((target.distance(&peer.id), peer.id));
                    let mut responder = peer;
                    for node in nodes {
                        if node.id == responder.id {
                            responder = node;
                            continue;
                        }
                        if node.id == local || known.contains_key(&node.id) {
                            continue;
                        }
                        let _ = candidates.insert((target.distance(&node.id), node.id));
                        let _ = known.insert(node.id, node);
                    }
                    let _ = lock(&table).insert(responder.clone());
                    let _ = known.insert(responder.id, responder);
                }
                Err(err) => debug!("find_nodes to {} failed: {:?}", peer.id, err),
            }
        }
    }

    responded.into_iter().take(k).filter_map(|(_, id)| known.remove(&id)).collect()
}

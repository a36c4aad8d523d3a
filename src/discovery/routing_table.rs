//! Kademlia routing table: peers bucketed by XOR distance to the local id.
use super::peer::PeerInfo;
use crate::zfx_id::{Id, ID_BITS};

/// Maximum peers per bucket.
pub const K: usize = 20;

/// Parallel queries per lookup round.
pub const ALPHA: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Insert {
    Added,
    Updated,
    /// The bucket is full; `oldest` is the least recently seen peer in it.
    BucketFull { oldest: Id },
    /// The local node is never stored.
    Local,
}

/// Peers ordered by time last seen, least recent first.
#[derive(Debug, Clone, Default)]
struct KBucket {
    peers: Vec<PeerInfo>,
}

impl KBucket {
    fn upsert(&mut self, peer: PeerInfo, capacity: usize) -> Insert {
        if let Some(position) = self.peers.iter().position(|p| p.id == peer.id) {
            self.peers.remove(position);
            self.peers.push(peer);
            return Insert::Updated;
        }
        if self.peers.len() < capacity {
            self.peers.push(peer);
            return Insert::Added;
        }
        Insert::BucketFull { oldest: self.peers[0].id }
    }

    fn remove(&mut self, id: &Id) -> Option<PeerInfo> {
        let position = self.peers.iter().position(|p| p.id == *id)?;
        Some(self.peers.remove(position))
    }
}

pub struct RoutingTable {
    local: Id,
    bucket_size: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: Id) -> Self {
        RoutingTable::with_bucket_size(local, K)
    }

    pub fn with_bucket_size(local: Id, bucket_size: usize) -> Self {
        RoutingTable { local, bucket_size: bucket_size.max(1), buckets: vec![KBucket::default(); ID_BITS] }
    }

    pub fn local(&self) -> Id {
        self.local
    }

    /// Adds or refreshes a peer. Full buckets keep their existing peers.
    pub fn insert(&mut self, peer: PeerInfo) -> Insert {
        match self.local.bucket_index(&peer.id) {
            Some(index) => self.buckets[index].upsert(peer, self.bucket_size),
            None => Insert::Local,
        }
    }

    /// Evicts `oldest` in favour of `peer`, e.g. after `oldest` failed to respond.
    pub fn replace(&mut self, oldest: &Id, peer: PeerInfo) -> Insert {
        self.remove(oldest);
        self.insert(peer)
    }

    pub fn remove(&mut self, id: &Id) -> Option<PeerInfo> {
        let index = self.local.bucket_index(id)?;
        self.buckets[index].remove(id)
    }

    pub fn get(&self, id: &Id) -> Option<&PeerInfo> {
        let index = self.local.bucket_index(id)?;
        self.buckets[index].peers.iter().find(|p| p.id == *id)
    }

    /// Up to `count` known peers closest to `target`.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<PeerInfo> {
        let mut peers: Vec<&PeerInfo> = self.buckets.iter().flat_map(|b| b.peers.iter()).collect();
        peers.sort_by_key(|p| target.distance(&p.id));
        peers.into_iter().take(count).cloned().collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.buckets.iter().flat_map(|b| b.peers.iter().cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

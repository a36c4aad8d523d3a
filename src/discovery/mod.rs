//! Peer Discovery: finds peers through a Kademlia style lookup and ranks them.
//!
//! The [PeerDiscovery] actor owns the ranked peer table. Readers get an `Arc` snapshot that
//! is swapped as a whole, never a half-updated table.
mod lookup;
mod peer;
mod peer_discovery;
mod ranking;
mod routing_table;

pub use lookup::{DhtLookup, Lookup, NodeQuery};
pub use peer::{Capabilities, CapabilityFilter, PeerInfo, Reliability};
pub use peer_discovery::*;
pub use ranking::{Ranking, RankingWeights};
pub use routing_table::{Insert, RoutingTable, ALPHA, K};

use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub weights: RankingWeights,
    pub reference_latency_ms: u64,
    pub capacity_saturation: u64,
    /// Interval of the periodic rediscovery; 0 disables it.
    pub refresh_interval_ms: u64,
    pub k: usize,
    pub alpha: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            weights: RankingWeights::default(),
            reference_latency_ms: 100,
            capacity_saturation: 1_000,
            refresh_interval_ms: 30_000,
            k: K,
            alpha: ALPHA,
        }
    }
}

impl DiscoverySettings {
    pub fn ranking(&self) -> Ranking {
        Ranking {
            weights: self.weights,
            reference_latency: Duration::from_millis(self.reference_latency_ms),
            capacity_saturation: self.capacity_saturation,
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.refresh_interval_ms))
        }
    }
}

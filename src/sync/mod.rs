//! State Synchronizer: keeps the replicated [NetworkState] converging across nodes.
//!
//! Local updates are proposed to a pluggable [Quorum] and applied once accepted. Replicas
//! compare [Digest]s; a replica that is behind fetches the missing deltas, a replica that
//! is ahead pushes them, and replicas at the same version with different content merge
//! their full states.
mod quorum;
mod request;
mod state;
mod synchronizer;

pub use quorum::{AckQuorum, Decision, LocalQuorum, Quorum, SyncTransport};
pub use request::{Proposal, SyncRequest, SyncResponse};
pub use state::{
    diff, hash_entries, merge, Changes, Delta, DeltaLog, Digest, Entry, NetworkState, Reconciled,
    Snapshot, Tag,
};
pub use synchronizer::*;

use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Interval of anti-entropy rounds; 0 disables them.
    pub propagation_interval_ms: u64,
    /// Peers contacted per round.
    pub fanout: usize,
    /// Fraction of nodes, this one included, that must accept a proposal.
    pub quorum_threshold: f64,
    /// Deltas kept for peers that fell behind.
    pub max_log: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings { propagation_interval_ms: 2_000, fanout: 3, quorum_threshold: 0.5, max_log: 1024 }
    }
}

impl SyncSettings {
    pub fn propagation_interval(&self) -> Option<Duration> {
        if self.propagation_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.propagation_interval_ms))
        }
    }
}

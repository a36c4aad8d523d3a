use super::state::{Changes, Delta, Digest, Snapshot};
use crate::zfx_id::Id;

use actix_derive::MessageResponse;

/// A local update awaiting a quorum decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub origin: Id,
    pub version: u64,
    pub changes: Changes,
    pub hash: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncRequest {
    /// Anti-entropy: the sender's digest. Answered with the receiver's digest.
    Digest(Digest),
    /// Deltas after the given version.
    Since(u64),
    /// The full state.
    State,
    /// Vote on a proposal.
    Propose(Proposal),
    /// Deltas the receiver is missing.
    Push(Vec<Delta>),
}

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub enum SyncResponse {
    Digest(Digest),
    Deltas(Vec<Delta>),
    State(Snapshot),
    Vote(bool),
    Ack,
}

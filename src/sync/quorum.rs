use super::request::{Proposal, SyncRequest, SyncResponse};
use crate::zfx_id::Id;
use crate::Result;

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::debug;

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// The agreement step for local updates: propose, then apply or discard on the decision.
pub trait Quorum: Send + Sync {
    fn decide(&self, proposal: Proposal) -> BoxFuture<'static, Decision>;
}

/// How the synchronizer reaches other replicas.
pub trait SyncTransport: Send + Sync {
    fn peers(&self) -> Vec<Id>;

    fn request(&self, peer: Id, request: SyncRequest) -> BoxFuture<'static, Result<SyncResponse>>;

    /// Fire and forget to every peer.
    fn broadcast(&self, request: SyncRequest) -> BoxFuture<'static, ()>;
}

/// Accepts everything; for a single node or when agreement is handled elsewhere.
pub struct LocalQuorum;

impl Quorum for LocalQuorum {
    fn decide(&self, _proposal: Proposal) -> BoxFuture<'static, Decision> {
        async { Decision::Accept }.boxed()
    }
}

/// Asks every connected peer to vote and accepts when at least `threshold` of all nodes,
/// this one included, agree. Peers that fail to answer count as rejections.
pub struct AckQuorum {
    transport: Arc<dyn SyncTransport>,
    threshold: f64,
}

impl AckQuorum {
    pub fn new(transport: Arc<dyn SyncTransport>, threshold: f64) -> Self {
        AckQuorum { transport, threshold: threshold.max(0.0).min(1.0) }
    }
}

impl Quorum for AckQuorum {
    fn decide(&self, proposal: Proposal) -> BoxFuture<'static, Decision> {
        let peers = self.transport.peers();
        let required = ((peers.len() + 1) as f64 * self.threshold).ceil() as usize;
        let requests: Vec<_> = peers
            .into_iter()
            .map(|peer| self.transport.request(peer, SyncRequest::Propose(proposal.clone())))
            .collect();
        async move {
            let responses = join_all(requests).await;
            let accepted =
                1 + responses.iter().filter(|r| matches!(r, Ok(SyncResponse::Vote(true)))).count();
            debug!("proposal v{}: {} accepted, {} required", proposal.version, accepted, required);
            if accepted >= required {
                Decision::Accept
            } else {
                Decision::Reject
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Changes;
    use crate::Error;

    struct Voters {
        votes: Vec<Option<bool>>,
    }

    impl SyncTransport for Voters {
        fn peers(&self) -> Vec<Id> {
            (0..self.votes.len()).map(|i| Id::new(&[i as u8])).collect()
        }

        fn request(&self, peer: Id, _request: SyncRequest) -> BoxFuture<'static, Result<SyncResponse>> {
            let index = self.peers().iter().position(|p| *p == peer).unwrap();
            let response = match self.votes[index] {
                Some(vote) => Ok(SyncResponse::Vote(vote)),
                None => Err(Error::Timeout),
            };
            async move { response }.boxed()
        }

        fn broadcast(&self, _request: SyncRequest) -> BoxFuture<'static, ()> {
            async {}.boxed()
        }
    }

    fn proposal() -> Proposal {
        Proposal { origin: Id::one(), version: 1, changes: Changes::new(), hash: [0u8; 32] }
    }

    async fn decide(votes: Vec<Option<bool>>, threshold: f64) -> Decision {
        AckQuorum::new(Arc::new(Voters { votes }), threshold).decide(proposal()).await
    }

    #[tokio::test]
    async fn counts_votes_against_threshold() {
        assert_eq!(LocalQuorum.decide(proposal()).await, Decision::Accept);
        assert_eq!(decide(vec![], 1.0).await, Decision::Accept);
        // 3 of 4 nodes
        assert_eq!(decide(vec![Some(true), Some(true), Some(false)], 0.75).await, Decision::Accept);
        // 2 of 4 nodes
        assert_eq!(decide(vec![Some(true), None, Some(false)], 0.75).await, Decision::Reject);
        assert_eq!(decide(vec![Some(true), None, Some(false)], 0.5).await, Decision::Accept);
    }
}

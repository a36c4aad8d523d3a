use super::lookup::Lookup;
use super::peer::{CapabilityFilter, PeerInfo, Reliability};
use super::ranking::Ranking;
use super::DiscoverySettings;
use crate::colored::Colorize;
use crate::zfx_id::Id;
use crate::Result;

use actix::{Actor, ActorFutureExt, AsyncContext, Context, Handler, ResponseActFuture, ResponseFuture, WrapFuture};
use actix_derive::{Message, MessageResponse};
use tracing::{debug, info};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Owns the ranked peer table and the interaction history used to rank it.
pub struct PeerDiscovery {
    lookup: Arc<dyn Lookup>,
    ranking: Ranking,
    settings: DiscoverySettings,
    /// Filter used by the periodic refresh.
    filter: CapabilityFilter,
    table: Arc<Vec<PeerInfo>>,
    reliability: HashMap<Id, Reliability>,
    latency: HashMap<Id, Duration>,
}

impl PeerDiscovery {
    pub fn new(lookup: Arc<dyn Lookup>, settings: DiscoverySettings) -> Self {
        PeerDiscovery {
            lookup,
            ranking: settings.ranking(),
            settings,
            filter: CapabilityFilter::any(),
            table: Arc::new(vec![]),
            reliability: HashMap::new(),
            latency: HashMap::new(),
        }
    }

    pub fn with_filter(mut self, filter: CapabilityFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Overrides the peer's self reported figures with what this node measured.
    fn annotate(&self, mut peer: PeerInfo) -> PeerInfo {
        peer.reliability = self.reliability.get(&peer.id).copied().unwrap_or_default().score();
        if let Some(latency) = self.latency.get(&peer.id) {
            peer.latency = Some(*latency);
        }
        peer
    }

    fn rank(&self, peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
        let annotated = peers.into_iter().map(|p| self.annotate(p)).collect();
        self.ranking.rank(annotated)
    }

    fn rerank_table(&mut self) {
        let peers = self.table.iter().cloned().collect();
        self.table = Arc::new(self.rank(peers));
    }
}

impl Actor for PeerDiscovery {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Context<Self>) {
        debug!("[{}] started", "discovery".green());
        if let Some(interval) = self.settings.refresh_interval() {
            ctx.run_interval(interval, |act, ctx| {
                ctx.notify(DiscoverPeers { filter: act.filter.clone() });
            });
        }
    }
}

/// An immutable snapshot of the ranked peer table, best first.
#[derive(Debug, Clone, MessageResponse)]
pub struct PeerTable {
    pub peers: Arc<Vec<PeerInfo>>,
}

/// Queries the network for peers matching `filter` and replaces the peer table with the
/// ranked result.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Result<PeerTable>")]
pub struct DiscoverPeers {
    pub filter: CapabilityFilter,
}

impl Handler<DiscoverPeers> for PeerDiscovery {
    type Result = ResponseActFuture<Self, Result<PeerTable>>;

    fn handle(&mut self, msg: DiscoverPeers, _ctx: &mut Context<Self>) -> Self::Result {
        let lookup = self.lookup.lookup(msg.filter);
        let update_table = lookup.into_actor(self).map(|result, act, _ctx| -> Result<PeerTable> {
            let ranked = act.rank(result?);
            info!("[{}] peer table refreshed with {} peers", "discovery".green(), ranked.len());
            act.table = Arc::new(ranked);
            Ok(PeerTable { peers: act.table.clone() })
        });
        Box::pin(update_table)
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "PeerTable")]
pub struct GetPeerTable;

impl Handler<GetPeerTable> for PeerDiscovery {
    type Result = PeerTable;

    fn handle(&mut self, _msg: GetPeerTable, _ctx: &mut Context<Self>) -> Self::Result {
        PeerTable { peers: self.table.clone() }
    }
}

/// Adds a peer (e.g. one that just connected) to the routing table.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct ObservePeer {
    pub peer: PeerInfo,
}

impl Handler<ObservePeer> for PeerDiscovery {
    type Result = ResponseFuture<()>;

    fn handle(&mut self, msg: ObservePeer, _ctx: &mut Context<Self>) -> Self::Result {
        Box::pin(self.lookup.observe(msg.peer))
    }
}

/// Outcome of one interaction (connection attempt, request) with a peer.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct RecordOutcome {
    pub peer: Id,
    pub success: bool,
}

impl Handler<RecordOutcome> for PeerDiscovery {
    type Result = ();

    fn handle(&mut self, msg: RecordOutcome, _ctx: &mut Context<Self>) -> Self::Result {
        self.reliability.entry(msg.peer).or_default().record(msg.success);
        self.rerank_table();
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct RecordLatency {
    pub peer: Id,
    pub latency: Duration,
}

impl Handler<RecordLatency> for PeerDiscovery {
    type Result = ();

    fn handle(&mut self, msg: RecordLatency, _ctx: &mut Context<Self>) -> Self::Result {
        // Exponentially weighted, 1/4 weight on the new sample.
        let latency = match self.latency.get(&msg.peer) {
            Some(previous) => (*previous * 3 + msg.latency) / 4,
            None => msg.latency,
        };
        let _ = self.latency.insert(msg.peer, latency);
        self.rerank_table();
    }
}

/// Looks for the best peer to take over from `lost`, which is counted as a failure and
/// dropped from the routing table and the peer table.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Result<Option<PeerInfo>>")]
pub struct FindReplacement {
    pub lost: Id,
    pub filter: CapabilityFilter,
    /// Peers that must not be returned, e.g. those already connected.
    pub exclude: Vec<Id>,
}

impl Handler<FindReplacement> for PeerDiscovery {
    type Result = ResponseActFuture<Self, Result<Option<PeerInfo>>>;

    fn handle(&mut self, msg: FindReplacement, _ctx: &mut Context<Self>) -> Self::Result {
        let lost = msg.lost;
        self.reliability.entry(lost).or_default().record(false);
        self.lookup.forget(&lost);
        let remaining = self.table.iter().filter(|p| p.id != lost).cloned().collect();
        self.table = Arc::new(remaining);

        let exclude = msg.exclude;
        let lookup = self.lookup.lookup(msg.filter);
        let choose = lookup.into_actor(self).map(move |result, act, _ctx| -> Result<Option<PeerInfo>> {
            let candidates =
                result?.into_iter().filter(|p| p.id != lost && !exclude.contains(&p.id)).collect();
            let replacement = act.rank(candidates).into_iter().next();
            match &replacement {
                Some(peer) => info!("[{}] replacing {} with {:?}", "discovery".green(), lost, peer),
                None => info!("[{}] no replacement for {}", "discovery".green(), lost),
            }
            Ok(replacement)
        });
        Box::pin(choose)
    }
}

/// Answers a remote lookup step: the locally known peers closest to `target`.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Nodes")]
pub struct FindNodes {
    pub target: Id,
}

#[derive(Debug, Clone, MessageResponse)]
pub struct Nodes {
    pub peers: Vec<PeerInfo>,
}

impl Handler<FindNodes> for PeerDiscovery {
    type Result = Nodes;

    fn handle(&mut self, msg: FindNodes, _ctx: &mut Context<Self>) -> Self::Result {
        Nodes { peers: self.lookup.closest(&msg.target, self.settings.k) }
    }
}

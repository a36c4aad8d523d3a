use crate::discovery::{FindNodes, ObservePeer, PeerDiscovery, PeerInfo};
use crate::protocol::{Request, Response};
use crate::registry::{ReceiveAnnouncement, ServiceRegistry};
use crate::sync::{HandleSyncRequest, StateSynchronizer};
use crate::zfx_id::Id;

use actix::{Actor, Addr, Context, Handler, ResponseFuture};
use actix_derive::Message;
use tracing::{debug, warn};

/// Hands requests from peers to the actor responsible for them.
pub struct Router {
    local: PeerInfo,
    registry: Addr<ServiceRegistry>,
    discovery: Addr<PeerDiscovery>,
    sync: Addr<StateSynchronizer>,
}

impl Router {
    pub fn new(
        local: PeerInfo,
        registry: Addr<ServiceRegistry>,
        discovery: Addr<PeerDiscovery>,
        sync: Addr<StateSynchronizer>,
    ) -> Self {
        Router { local, registry, discovery, sync }
    }
}

impl Actor for Router {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Context<Self>) {
        debug!("router> started");
    }
}

/// A request received from `from` over an authenticated connection.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Response")]
pub struct Routed {
    pub from: Id,
    pub request: Request,
}

impl Handler<Routed> for Router {
    type Result = ResponseFuture<Response>;

    fn handle(&mut self, msg: Routed, _ctx: &mut Context<Self>) -> Self::Result {
        let local = self.local.clone();
        let registry = self.registry.clone();
        let discovery = self.discovery.clone();
        let sync = self.sync.clone();
        let from = msg.from;
        Box::pin(async move {
            let routed = match msg.request {
                Request::Announce(service) => {
                    debug!("routing Announce -> ServiceRegistry");
                    registry.send(ReceiveAnnouncement { service }).await.map(|()| Response::Ack)
                }
                Request::FindNodes { target, sender } => {
                    debug!("routing FindNodes -> PeerDiscovery");
                    // Only the connection's authenticated peer may describe itself.
                    if sender.id == from {
                        discovery.do_send(ObservePeer { peer: sender });
                    }
                    discovery.send(FindNodes { target }).await.map(|nodes| {
                        let mut peers = vec![local];
                        peers.extend(nodes.peers.into_iter().filter(|p| p.id != from));
                        Response::Nodes(peers)
                    })
                }
                Request::Sync(request) => {
                    debug!("routing Sync -> StateSynchronizer");
                    sync.send(HandleSyncRequest { from, request }).await.map(Response::Sync)
                }
            };
            routed.unwrap_or_else(|err| {
                warn!("dropping request from {}: {:?}", from, err);
                Response::Unknown
            })
        })
    }
}

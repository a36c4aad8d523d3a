//! Adapters between the node protocol and the network facing traits of discovery, the
//! registry and state synchronization.
use crate::discovery::{NodeQuery, PeerInfo};
use crate::protocol::{Request, Response};
use crate::registry::{Announcer, ServiceInfo};
use crate::rpc::Rpc;
use crate::sync::{SyncRequest, SyncResponse, SyncTransport};
use crate::zfx_id::Id;
use crate::{Error, Result};

use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::debug;

use std::sync::Arc;
use std::time::Instant;

/// Runs lookup steps as `FindNodes` requests, dialing the peer first when needed.
pub struct RpcNodeQuery {
    rpc: Arc<Rpc>,
    local: PeerInfo,
}

impl RpcNodeQuery {
    pub fn new(rpc: Arc<Rpc>, local: PeerInfo) -> Self {
        RpcNodeQuery { rpc, local }
    }
}

impl NodeQuery for RpcNodeQuery {
    fn find_nodes(&self, peer: PeerInfo, target: Id) -> BoxFuture<'static, Result<Vec<PeerInfo>>> {
        let rpc = self.rpc.clone();
        let sender = self.local.clone();
        async move {
            let _ = rpc.connections().connect(peer.address, Some(peer.id)).await?;
            let started = Instant::now();
            match rpc.request(peer.id, Request::FindNodes { target, sender }).await? {
                Response::Nodes(mut nodes) => {
                    // The responder describes itself first; attach the round trip we just saw.
                    if let Some(responder) = nodes.iter_mut().find(|p| p.id == peer.id) {
                        responder.latency = Some(started.elapsed());
                    }
                    Ok(nodes)
                }
                other => {
                    debug!("unexpected answer to FindNodes from {}: {:?}", peer.id, other);
                    Err(Error::EmptyResponse)
                }
            }
        }
        .boxed()
    }
}

/// Reaches the other replicas over the established connections.
pub struct RpcSyncTransport {
    rpc: Arc<Rpc>,
}

impl RpcSyncTransport {
    pub fn new(rpc: Arc<Rpc>) -> Self {
        RpcSyncTransport { rpc }
    }
}

impl SyncTransport for RpcSyncTransport {
    fn peers(&self) -> Vec<Id> {
        self.rpc.connections().peers()
    }

    fn request(&self, peer: Id, request: SyncRequest) -> BoxFuture<'static, Result<SyncResponse>> {
        let rpc = self.rpc.clone();
        async move {
            match rpc.request(peer, Request::Sync(request)).await? {
                Response::Sync(response) => Ok(response),
                _ => Err(Error::EmptyResponse),
            }
        }
        .boxed()
    }

    fn broadcast(&self, request: SyncRequest) -> BoxFuture<'static, ()> {
        notify_all(self.rpc.clone(), Request::Sync(request))
    }
}

/// Announces services to every connected peer.
pub struct RpcAnnouncer {
    rpc: Arc<Rpc>,
}

impl RpcAnnouncer {
    pub fn new(rpc: Arc<Rpc>) -> Self {
        RpcAnnouncer { rpc }
    }
}

impl Announcer for RpcAnnouncer {
    fn announce(&self, service: ServiceInfo) -> BoxFuture<'static, ()> {
        notify_all(self.rpc.clone(), Request::Announce(service))
    }
}

fn notify_all(rpc: Arc<Rpc>, request: Request) -> BoxFuture<'static, ()> {
    async move {
        let peers = rpc.connections().peers();
        let sends = peers.iter().map(|peer| {
            let rpc = rpc.clone();
            let request = request.clone();
            let peer = *peer;
            async move {
                if let Err(err) = rpc.notify(peer, request).await {
                    debug!("notify {} failed: {:?}", peer, err);
                }
            }
        });
        let _ = join_all(sends).await;
    }
    .boxed()
}

use crate::backoff::Execute;
use crate::connection::ConnectionManager;
use crate::discovery::{CapabilityFilter, DiscoverPeers, ObservePeer, PeerDiscovery, PeerInfo};
use crate::zfx_id::Id;

use actix::{Actor, ActorFutureExt, Addr, Context, Handler, ResponseActFuture, WrapFuture};
use futures::future::join_all;
use tracing::{info, warn};

use std::net::SocketAddr;
use std::sync::Arc;

/// Connects to the configured bootstrap peers, seeding discovery with each one reached.
/// Driven by a [LinearBackoff](crate::backoff::LinearBackoff) until every peer answered.
pub struct Bootstrapper {
    connections: Arc<ConnectionManager>,
    discovery: Addr<PeerDiscovery>,
    remaining: Vec<(Option<Id>, SocketAddr)>,
}

impl Bootstrapper {
    pub fn new(
        connections: Arc<ConnectionManager>,
        discovery: Addr<PeerDiscovery>,
        peers: Vec<(Option<Id>, SocketAddr)>,
    ) -> Self {
        Bootstrapper { connections, discovery, remaining: peers }
    }
}

impl Actor for Bootstrapper {
    type Context = Context<Self>;
}

impl Handler<Execute> for Bootstrapper {
    type Result = ResponseActFuture<Self, bool>;

    fn handle(&mut self, _msg: Execute, _ctx: &mut Context<Self>) -> Self::Result {
        let attempts = self.remaining.iter().map(|(expected, address)| {
            let connections = self.connections.clone();
            let (expected, address) = (*expected, *address);
            async move {
                let result = connections.connect(address, expected).await;
                (expected, address, result)
            }
        });
        let attempts = join_all(attempts).into_actor(self).map(|results, act, _ctx| {
            let mut remaining = vec![];
            let mut reached = 0;
            for (expected, address, result) in results {
                match result {
                    Ok(connection) => {
                        reached += 1;
                        act.discovery.do_send(ObservePeer { peer: PeerInfo::new(connection.peer(), address) });
                    }
                    Err(err) => {
                        warn!("bootstrap peer {} unreachable: {:?}", address, err);
                        remaining.push((expected, address));
                    }
                }
            }
            if reached > 0 {
                info!("reached {} bootstrap peers", reached);
                act.discovery.do_send(DiscoverPeers { filter: CapabilityFilter::any() });
            }
            act.remaining = remaining;
            act.remaining.is_empty()
        });
        Box::pin(attempts)
    }
}

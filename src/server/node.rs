//! Wires the layers of a mesh node together.
use super::bootstrap::Bootstrapper;
use super::network::{RpcAnnouncer, RpcNodeQuery, RpcSyncTransport};
use super::router::{Routed, Router};
use super::server::Server;
use super::settings::Settings;
use crate::backoff::{LinearBackoff, Start};
use crate::colored::Colorize;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::crypto::{CryptoGuard, KeyStore, LocalIdentity};
use crate::discovery::{
    Capabilities, CapabilityFilter, DhtLookup, DiscoverPeers, FindReplacement, PeerDiscovery, PeerInfo,
    RecordOutcome,
};
use crate::message::Encoding;
use crate::registry::{FindService, Register, ServiceInfo, ServiceRegistry, TcpHealthCheck};
use crate::rpc::{Incoming, Rpc};
use crate::sync::{AckQuorum, Digest, GetState, Propose, Snapshot, StateSynchronizer};
use crate::transport::{Delivery, SendOptions};
use crate::zfx_id::Id;
use crate::{Error, Result};

use actix::{Actor, Addr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DELIVERY_QUEUE: usize = 1024;
const APPLICATION_QUEUE: usize = 1024;
const MAX_BOOTSTRAP_DELAY: Duration = Duration::from_secs(30);

/// A running node. Must be started from within an actix system.
pub struct Node {
    id: Id,
    address: SocketAddr,
    rpc: Arc<Rpc>,
    registry: Addr<ServiceRegistry>,
    discovery: Addr<PeerDiscovery>,
    sync: Addr<StateSynchronizer>,
    applications: Option<mpsc::Receiver<Delivery>>,
    cancel: CancellationToken,
}

impl Node {
    pub async fn start(settings: Settings, identity: LocalIdentity, keys: Arc<dyn KeyStore>) -> Result<Node> {
        let id = identity.id();
        let bootstrap_peers = settings.bootstrap_peers()?;
        let (deliveries_tx, deliveries) = mpsc::channel(DELIVERY_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        let guard = Arc::new(CryptoGuard::new(Arc::new(identity), settings.rate_limit));
        let connections = Arc::new(ConnectionManager::new(
            guard,
            keys,
            settings.connection.clone(),
            settings.transport.clone(),
            deliveries_tx,
            events_tx,
        ));
        let server = Server::bind(settings.listener_address()?, connections.clone()).await?;
        let address = server.local_addr()?;
        info!("node {} is starting on {}", id, address);

        let rpc = Arc::new(Rpc::new(connections.clone(), settings.rpc_timeout()));
        let local = PeerInfo {
            capacity: settings.capacity,
            capabilities: Capabilities {
                region: settings.region.clone(),
                services: settings.services.iter().cloned().collect(),
            },
            ..PeerInfo::new(id, address)
        };

        let query = Arc::new(RpcNodeQuery::new(rpc.clone(), local.clone()));
        let lookup = DhtLookup::new(id, query, settings.discovery.k, settings.discovery.alpha);
        let discovery = PeerDiscovery::new(Arc::new(lookup), settings.discovery.clone()).start();

        let registry = ServiceRegistry::new(
            id,
            settings.registry.clone(),
            Arc::new(TcpHealthCheck),
            Arc::new(RpcAnnouncer::new(rpc.clone())),
        )
        .start();

        let sync_transport = Arc::new(RpcSyncTransport::new(rpc.clone()));
        let quorum = Arc::new(AckQuorum::new(sync_transport.clone(), settings.sync.quorum_threshold));
        let sync = StateSynchronizer::new(id, settings.sync.clone(), quorum, sync_transport).start();

        let router = Router::new(local, registry.clone(), discovery.clone(), sync.clone()).start();

        let (applications_tx, applications) = mpsc::channel(APPLICATION_QUEUE);
        actix_rt::spawn(route_deliveries(deliveries, rpc.clone(), router, applications_tx));
        actix_rt::spawn(handle_events(events, connections.clone(), discovery.clone()));

        let cancel = CancellationToken::new();
        let listening = server.listen(cancel.child_token());
        actix_rt::spawn(async move {
            if let Err(err) = listening.await {
                error!("listener failed: {:?}", err);
            }
        });

        if !bootstrap_peers.is_empty() {
            let bootstrapper = Bootstrapper::new(connections, discovery.clone(), bootstrap_peers).start();
            let backoff =
                LinearBackoff::new(bootstrapper.recipient(), settings.bootstrap_delta(), MAX_BOOTSTRAP_DELAY)
                    .start();
            backoff.do_send(Start);
        }

        Ok(Node { id, address, rpc, registry, discovery, sync, applications: Some(applications), cancel })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// The address the node listens on.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.rpc.connections()
    }

    /// Application payloads (RAW encoding) received from peers. Can be taken once.
    pub fn applications(&mut self) -> Option<mpsc::Receiver<Delivery>> {
        self.applications.take()
    }

    pub async fn connect(&self, address: SocketAddr) -> Result<Id> {
        let connection = self.connections().connect(address, None).await?;
        Ok(connection.peer())
    }

    /// Sends an application payload to a connected peer.
    pub async fn send(&self, peer: &Id, payload: Vec<u8>, options: SendOptions) -> Result<Id> {
        self.connections().send(peer, payload, options).await
    }

    pub async fn register(&self, service: ServiceInfo) -> Result<()> {
        self.registry.send(Register { service }).await?
    }

    pub async fn find_service(&self, name: &str, healthy_only: bool) -> Result<Vec<ServiceInfo>> {
        Ok(self.registry.send(FindService { name: name.to_string(), healthy_only }).await?)
    }

    pub async fn discover(&self, filter: CapabilityFilter) -> Result<Arc<Vec<PeerInfo>>> {
        let table = self.discovery.send(DiscoverPeers { filter }).await??;
        Ok(table.peers)
    }

    /// Proposes updates to the shared state; `None` deletes a key.
    pub async fn propose(&self, updates: Vec<(String, Option<Vec<u8>>)>) -> Result<Digest> {
        self.sync.send(Propose { updates }).await?
    }

    pub async fn state(&self) -> Result<Snapshot> {
        Ok(self.sync.send(GetState).await?)
    }

    /// Stops accepting connections and closes the existing ones.
    pub async fn shutdown(&self) {
        info!("node {} is shutting down", self.id);
        self.cancel.cancel();
        self.connections().close_all().await;
    }
}

/// Answers protocol requests and forwards application payloads.
async fn route_deliveries(
    mut deliveries: mpsc::Receiver<Delivery>,
    rpc: Arc<Rpc>,
    router: Addr<Router>,
    applications: mpsc::Sender<Delivery>,
) {
    while let Some(delivery) = deliveries.recv().await {
        if delivery.encoding == Encoding::Raw {
            if applications.send(delivery).await.is_err() {
                debug!("no application reader, dropping payload");
            }
            continue;
        }
        match rpc.dispatch(&delivery) {
            Ok(Some(incoming)) => {
                actix_rt::spawn(answer(incoming, rpc.clone(), router.clone()));
            }
            Ok(None) => (),
            Err(err) => warn!("undecodable protocol message from {}: {:?}", delivery.from, err),
        }
    }
    debug!("delivery loop finished");
}

async fn answer(incoming: Incoming, rpc: Arc<Rpc>, router: Addr<Router>) {
    let from = incoming.from;
    let response = match router.send(Routed { from, request: incoming.request }).await {
        Ok(response) => response,
        Err(err) => {
            error!("router unavailable: {:?}", err);
            return;
        }
    };
    if let Some(id) = incoming.reply_to {
        if let Err(err) = rpc.respond(from, id, response).await {
            debug!("response to {} failed: {:?}", from, err);
        }
    }
}

/// Feeds connection outcomes to discovery and replaces peers that were lost.
async fn handle_events(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    connections: Arc<ConnectionManager>,
    discovery: Addr<PeerDiscovery>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Established { peer, .. } => {
                discovery.do_send(RecordOutcome { peer, success: true });
            }
            ConnectionEvent::Closed { peer, reason } if reason.is_failure() => {
                warn!("[{}] lost {}: {:?}", "node".magenta(), peer, reason);
                let exclude = connections.peers();
                let replacement =
                    discovery.send(FindReplacement { lost: peer, filter: CapabilityFilter::any(), exclude }).await;
                match replacement {
                    Ok(Ok(Some(replacement))) => {
                        actix_rt::spawn(replace(replacement, connections.clone(), discovery.clone()));
                    }
                    Ok(Ok(None)) => (),
                    Ok(Err(err)) => warn!("no replacement for {}: {:?}", peer, err),
                    Err(err) => error!("discovery unavailable: {:?}", err),
                }
            }
            ConnectionEvent::Closed { peer, reason } => debug!("closed {}: {:?}", peer, reason),
        }
    }
}

async fn replace(peer: PeerInfo, connections: Arc<ConnectionManager>, discovery: Addr<PeerDiscovery>) {
    if let Err(err) = connections.connect(peer.address, Some(peer.id)).await {
        warn!("replacement {} unreachable: {:?}", peer.id, err);
        discovery.do_send(RecordOutcome { peer: peer.id, success: false });
    }
}

/// Where the keypair lives when none is configured: `~/.zfx-mesh/node.keypair`.
pub fn default_keypair_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| Error::IO(std::io::ErrorKind::NotFound.into()))?;
    Ok(home.join(".zfx-mesh").join("node.keypair"))
}

/// Reads the hex encoded keypair at `path`, or generates one and stores it there.
pub fn load_or_generate_identity(path: &Path) -> Result<LocalIdentity> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let identity = LocalIdentity::from_hex(&contents)?;
            debug!("loaded keypair for {} from {:?}", identity.id(), path);
            Ok(identity)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let identity = LocalIdentity::generate();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut file = std::fs::File::create(path)?;
            file.write_all(identity.to_hex().as_bytes())?;
            info!("generated keypair for {} at {:?}", identity.id(), path);
            Ok(identity)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_generated_once() {
        let path = std::env::temp_dir().join(format!("zfx-mesh-{}", Id::generate())).join("node.keypair");
        let first = load_or_generate_identity(&path).unwrap();
        let second = load_or_generate_identity(&path).unwrap();
        assert_eq!(first.id(), second.id());
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn corrupt_keypair_is_an_error() {
        let dir = std::env::temp_dir().join(format!("zfx-mesh-{}", Id::generate()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.keypair");
        std::fs::write(&path, "not hex").unwrap();
        assert!(load_or_generate_identity(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

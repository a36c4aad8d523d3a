use super::handshake::{self, SessionParams};
use super::state::ConnectionState;
use super::{CloseReason, ConnectionEvent, ConnectionSettings};

use crate::channel::{Channel, Receiver, Sender};
use crate::colored::Colorize;
use crate::crypto::{CryptoGuard, KeyStore};
use crate::message::Message;
use crate::transport::{Control, Delivery, Inbound, SendOptions, Transport, TransportSettings};
use crate::zfx_id::Id;
use crate::{Error, Result};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct Connection {
    peer: Id,
    /// The node that opened the underlying stream.
    initiator: Id,
    address: Option<SocketAddr>,
    params: SessionParams,
    state: Mutex<ConnectionState>,
    transport: Arc<Transport>,
    cancel: CancellationToken,
    last_seen: Mutex<Instant>,
}

impl Connection {
    pub fn peer(&self) -> Id {
        self.peer
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn params(&self) -> SessionParams {
        self.params
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    fn transition(&self, next: ConnectionState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *state;
        state.transition(next)?;
        info!("connection {} {:?} -> {:?}", self.peer, previous, next);
        Ok(())
    }

    /// Sends over this connection. Only established connections accept new sends.
    pub async fn send(&self, payload: Vec<u8>, options: SendOptions) -> Result<Id> {
        match self.state() {
            ConnectionState::Established => self.transport.send(payload, options).await,
            ConnectionState::Draining => Err(Error::ConnectionDraining(self.peer)),
            _ => Err(Error::ConnectionClosed(self.peer)),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}

/// Owns every connection of the node, keyed by peer id.
pub struct ConnectionManager {
    guard: Arc<CryptoGuard>,
    keys: Arc<dyn KeyStore>,
    settings: ConnectionSettings,
    transport: TransportSettings,
    connections: Mutex<HashMap<Id, Arc<Connection>>>,
    deliveries: mpsc::Sender<Delivery>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        guard: Arc<CryptoGuard>,
        keys: Arc<dyn KeyStore>,
        settings: ConnectionSettings,
        transport: TransportSettings,
        deliveries: mpsc::Sender<Delivery>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        ConnectionManager {
            guard,
            keys,
            settings,
            transport,
            connections: Mutex::new(HashMap::new()),
            deliveries,
            events,
        }
    }

    pub fn local_id(&self) -> Id {
        self.guard.identity().id()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<Id, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection(&self, peer: &Id) -> Option<Arc<Connection>> {
        self.connections().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<Id> {
        self.connections().keys().cloned().collect()
    }

    /// Returns the connection to `expected` if there is one, otherwise dials `address`.
    pub async fn connect(self: &Arc<Self>, address: SocketAddr, expected: Option<Id>) -> Result<Arc<Connection>> {
        if let Some(connection) = expected.and_then(|peer| self.connection(&peer)) {
            if connection.state() == ConnectionState::Established {
                return Ok(connection);
            }
        }
        debug!("dialing {}", address);
        let socket = TcpStream::connect(address).await?;
        socket.set_nodelay(true)?;
        self.establish(socket, Some(address), expected, true).await
    }

    /// Runs the handshake over `stream` and, on success, starts the connection's tasks.
    ///
    /// When a connection to the same peer already exists only one of them survives: the
    /// newer one if both were opened by the same side, otherwise the one opened by the
    /// node with the smaller id. The surviving connection is returned.
    pub async fn establish<S>(
        self: &Arc<Self>,
        stream: S,
        address: Option<SocketAddr>,
        expected: Option<Id>,
        outbound: bool,
    ) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut state = ConnectionState::Connecting;
        let mut channel = Channel::new(stream);
        state.transition(ConnectionState::Handshaking)?;
        let handshake = handshake::perform(
            &mut channel,
            &self.guard,
            self.keys.as_ref(),
            self.transport.chunk_size,
            expected,
        );
        let outcome = match timeout(self.settings.handshake_timeout(), handshake).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                state.transition(ConnectionState::Closed)?;
                warn!("handshake with {:?} failed: {}", address, err);
                return Err(match err {
                    Error::HandshakeFailed(_) => err,
                    other => Error::HandshakeFailed(other.to_string()),
                });
            }
            Err(_) => {
                state.transition(ConnectionState::Closed)?;
                warn!("handshake with {:?} timed out", address);
                return Err(Error::HandshakeFailed("timed out".to_string()));
            }
        };

        let peer = outcome.peer;
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_queue.max(1));
        let transport = Transport::new(
            peer,
            outcome.peer_key,
            self.guard.clone(),
            outcome.session,
            outcome.params.chunk_size,
            self.transport.clone(),
            outbound_tx,
            self.deliveries.clone(),
        );
        let connection = Arc::new(Connection {
            peer,
            initiator: if outbound { self.local_id() } else { peer },
            address,
            params: outcome.params,
            state: Mutex::new(state),
            transport: Arc::new(transport),
            cancel: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
        });
        connection.transition(ConnectionState::Established)?;

        let (winner, loser) = {
            let mut connections = self.connections();
            match connections.get(&peer).cloned() {
                Some(existing) if !self.replaces(&existing, &connection) => (existing, Some(connection.clone())),
                existing => {
                    connections.insert(peer, connection.clone());
                    (connection.clone(), existing)
                }
            }
        };

        let (sender, receiver) = channel.split();
        self.spawn_tasks(&connection, sender, receiver, outbound_rx);

        if let Some(loser) = loser {
            debug!("closing superseded connection to {}", peer);
            self.close_with(&loser, CloseReason::Superseded).await;
        }
        if Arc::ptr_eq(&winner, &connection) {
            let _ = self.events.send(ConnectionEvent::Established { peer, address });
        }
        Ok(winner)
    }

    fn replaces(&self, existing: &Connection, candidate: &Connection) -> bool {
        if existing.state().is_closed() || existing.initiator == candidate.initiator {
            return true;
        }
        candidate.initiator == std::cmp::min(self.local_id(), candidate.peer)
    }

    fn spawn_tasks<S>(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        sender: Sender<S>,
        receiver: Receiver<S>,
        outbound: mpsc::Receiver<Message>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = connection.peer;
        let writer = self.clone().write_loop(connection.clone(), sender, outbound);
        tokio::spawn(writer.instrument(info_span!("writer", peer = %peer)));
        let reader = self.clone().read_loop(connection.clone(), receiver);
        tokio::spawn(reader.instrument(info_span!("reader", peer = %peer)));
        let keepalive = self.clone().keepalive_loop(connection.clone());
        tokio::spawn(keepalive.instrument(info_span!("keepalive", peer = %peer)));
    }

    async fn write_loop<S: AsyncWrite>(
        self: Arc<Self>,
        connection: Arc<Connection>,
        mut sender: Sender<S>,
        mut outbound: mpsc::Receiver<Message>,
    ) {
        let failed = loop {
            tokio::select! {
                biased;
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(err) = sender.send(message).await {
                            debug!("write failed: {}", err);
                            break true;
                        }
                    }
                    None => break false,
                },
                _ = connection.cancel.cancelled() => break false,
            }
        };
        drop(outbound);
        let _ = sender.close().await;
        if failed {
            self.close_with(&connection, CloseReason::StreamClosed).await;
        }
    }

    async fn read_loop<S: AsyncRead>(self: Arc<Self>, connection: Arc<Connection>, mut receiver: Receiver<S>) {
        loop {
            let next = tokio::select! {
                next = receiver.recv() => next,
                _ = connection.cancel.cancelled() => return,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.close_with(&connection, CloseReason::StreamClosed).await;
                    return;
                }
                Err(err) => {
                    warn!("unreadable frame from {}: {}", connection.peer, err);
                    self.close_with(&connection, CloseReason::ProtocolViolation(err.to_string())).await;
                    return;
                }
            };
            match connection.transport.receive(message).await {
                Ok(Inbound::Close(reason)) => {
                    self.close_with(&connection, CloseReason::Remote(reason)).await;
                    return;
                }
                Ok(_) => connection.touch(),
                Err(Error::ProtocolViolation(what)) => {
                    warn!("protocol violation by {}: {}", connection.peer, what);
                    self.close_with(&connection, CloseReason::ProtocolViolation(what.to_string())).await;
                    return;
                }
                Err(err) if err.is_security_fault() => {
                    warn!("dropped message from {}: {}", connection.peer, err)
                }
                Err(err) => debug!("inbound message from {} failed: {}", connection.peer, err),
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>, connection: Arc<Connection>) {
        let mut interval = tokio::time::interval(self.settings.heartbeat_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => (),
                _ = connection.cancel.cancelled() => return,
            }
            if connection.silent_for() > self.settings.keepalive_timeout() {
                warn!("{} missed {} heartbeats", connection.peer, self.settings.missed_heartbeats);
                self.close_with(&connection, CloseReason::KeepaliveTimeout).await;
                return;
            }
            if let Err(err) = connection.transport.maintain().await {
                debug!("maintenance for {} failed: {}", connection.peer, err);
            }
            if connection.transport.heartbeat().await.is_err() {
                return;
            }
        }
    }

    /// Closes a connection once. Locally requested closes are announced to the peer.
    async fn close_with(&self, connection: &Arc<Connection>, reason: CloseReason) {
        if connection.transition(ConnectionState::Closed).is_err() {
            return;
        }
        if matches!(reason, CloseReason::Requested | CloseReason::Superseded) {
            let close = Control::Close { reason: format!("{:?}", reason) };
            let _ = timeout(self.settings.heartbeat_interval(), connection.transport.send_control(close)).await;
        }
        connection.cancel.cancel();
        connection.transport.shutdown();
        let registered = {
            let mut connections = self.connections();
            match connections.get(&connection.peer) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    connections.remove(&connection.peer);
                    true
                }
                _ => false,
            }
        };
        if registered {
            info!("{} {} ({:?})", "closed".red(), connection.peer, reason);
            let _ = self.events.send(ConnectionEvent::Closed { peer: connection.peer, reason });
        }
    }

    /// Sends to a connected peer.
    pub async fn send(&self, peer: &Id, payload: Vec<u8>, options: SendOptions) -> Result<Id> {
        let connection = self.connection(peer).ok_or(Error::NotConnected(*peer))?;
        connection.send(payload, options).await
    }

    /// Stops accepting sends to `peer`, waits for in-flight sends (bounded by the drain
    /// timeout) and closes the connection.
    pub async fn drain(&self, peer: &Id) -> Result<()> {
        let connection = self.connection(peer).ok_or(Error::NotConnected(*peer))?;
        connection.transition(ConnectionState::Draining)?;
        if timeout(self.settings.drain_timeout(), connection.transport.flow().idle()).await.is_err() {
            warn!("drain of {} timed out with {} bytes in flight", peer, connection.transport.flow().current_load());
        }
        self.close_with(&connection, CloseReason::Requested).await;
        Ok(())
    }

    pub async fn close(&self, peer: &Id) -> Result<()> {
        let connection = self.connection(peer).ok_or(Error::NotConnected(*peer))?;
        self.close_with(&connection, CloseReason::Requested).await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let connections: Vec<_> = self.connections().values().cloned().collect();
        for connection in connections {
            self.close_with(&connection, CloseReason::Requested).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{LocalIdentity, MemoryKeyStore, RateLimitSettings};

    struct Side {
        manager: Arc<ConnectionManager>,
        deliveries: mpsc::Receiver<Delivery>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    fn side(settings: ConnectionSettings) -> Side {
        let identity = Arc::new(LocalIdentity::generate());
        let guard = Arc::new(CryptoGuard::new(identity, RateLimitSettings::default()));
        let (deliver_tx, deliveries) = mpsc::channel(16);
        let (event_tx, events) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            guard,
            Arc::new(MemoryKeyStore::new()),
            settings,
            TransportSettings::default(),
            deliver_tx,
            event_tx,
        );
        Side { manager: Arc::new(manager), deliveries, events }
    }

    async fn connected(a: &Side, b: &Side) -> (Arc<Connection>, Arc<Connection>) {
        let (left, right) = tokio::io::duplex(256 * 1024);
        let b_id = b.manager.local_id();
        let (a_conn, b_conn) = tokio::join!(
            a.manager.establish(left, None, Some(b_id), true),
            b.manager.establish(right, None, None, false),
        );
        (a_conn.unwrap(), b_conn.unwrap())
    }

    #[actix_rt::test]
    async fn established_connection_carries_data() {
        let a = side(ConnectionSettings::default());
        let mut b = side(ConnectionSettings::default());
        let (a_conn, b_conn) = connected(&a, &b).await;
        assert_eq!(a_conn.state(), ConnectionState::Established);
        assert_eq!(b_conn.peer(), a.manager.local_id());

        let options = SendOptions { require_ack: true, ..SendOptions::default() };
        let id = a.manager.send(&b.manager.local_id(), b"hello".to_vec(), options).await.unwrap();
        let delivery = b.deliveries.recv().await.unwrap();
        assert_eq!(delivery.message_id, id);
        assert_eq!(delivery.payload, b"hello".to_vec());

        let event = b.events.recv().await.unwrap();
        assert_eq!(event, ConnectionEvent::Established { peer: a.manager.local_id(), address: None });
    }

    #[actix_rt::test]
    async fn drain_rejects_new_sends_and_closes_both_sides() {
        let mut a = side(ConnectionSettings::default());
        let mut b = side(ConnectionSettings::default());
        let (a_conn, _b_conn) = connected(&a, &b).await;
        let b_id = b.manager.local_id();

        a_conn.transition(ConnectionState::Draining).unwrap();
        assert!(matches!(a_conn.send(vec![1], SendOptions::default()).await, Err(Error::ConnectionDraining(_))));
        a.manager.close_with(&a_conn, CloseReason::Requested).await;
        assert!(a.manager.connection(&b_id).is_none());

        let _ = a.events.recv().await;
        assert_eq!(a.events.recv().await.unwrap(), ConnectionEvent::Closed { peer: b_id, reason: CloseReason::Requested });
        let _ = b.events.recv().await;
        match b.events.recv().await.unwrap() {
            ConnectionEvent::Closed { reason: CloseReason::Remote(_), .. } => (),
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.manager.send(&b_id, vec![1], SendOptions::default()).await.is_err());
    }

    #[actix_rt::test]
    async fn drain_waits_for_idle() {
        let a = side(ConnectionSettings::default());
        let b = side(ConnectionSettings::default());
        let _ = connected(&a, &b).await;
        let b_id = b.manager.local_id();
        a.manager.drain(&b_id).await.unwrap();
        assert!(a.manager.connection(&b_id).is_none());
        assert!(matches!(a.manager.drain(&b_id).await, Err(Error::NotConnected(_))));
    }

    #[actix_rt::test]
    async fn silent_peer_is_closed_after_missed_heartbeats() {
        let fast = ConnectionSettings { heartbeat_interval_ms: 20, missed_heartbeats: 2, ..ConnectionSettings::default() };
        let slow = ConnectionSettings { heartbeat_interval_ms: 60_000, ..ConnectionSettings::default() };
        let mut a = side(fast);
        let b = side(slow);
        let _ = connected(&a, &b).await;
        let _ = a.events.recv().await;
        let closed = timeout(Duration::from_secs(2), a.events.recv()).await.unwrap().unwrap();
        match closed {
            ConnectionEvent::Closed { reason, .. } => {
                assert_eq!(reason, CloseReason::KeepaliveTimeout);
                assert!(reason.is_failure());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[actix_rt::test]
    async fn handshake_timeout_fails() {
        let settings = ConnectionSettings { handshake_timeout_ms: 30, ..ConnectionSettings::default() };
        let a = side(settings);
        let (left, _right) = tokio::io::duplex(1024);
        match a.manager.establish(left, None, None, true).await {
            Err(Error::HandshakeFailed(_)) => (),
            Err(e) => panic!("unexpected {:?}", e),
            Ok(_) => panic!("handshake with a silent peer succeeded"),
        }
    }

    #[actix_rt::test]
    async fn duplicate_connections_resolve_to_one() {
        let a = side(ConnectionSettings::default());
        let b = side(ConnectionSettings::default());
        let (first, _) = connected(&a, &b).await;
        let (second, _) = connected(&a, &b).await;
        // Both opened by `a`, so the newer one wins.
        assert!(Arc::ptr_eq(&a.manager.connection(&b.manager.local_id()).unwrap(), &second));
        assert_eq!(first.state(), ConnectionState::Closed);
    }
}

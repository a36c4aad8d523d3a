//! Request/response correlation over connections.
use crate::connection::ConnectionManager;
use crate::message::Encoding;
use crate::protocol::{Envelope, Request, Response};
use crate::transport::{Delivery, SendOptions};
use crate::zfx_id::Id;
use crate::{Error, Result};

use tokio::sync::oneshot;
use tracing::debug;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A request from a peer, to be answered with [Rpc::respond] when `reply_to` is set.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub from: Id,
    pub reply_to: Option<u64>,
    pub request: Request,
}

pub struct Rpc {
    connections: Arc<ConnectionManager>,
    pending: Mutex<HashMap<(Id, u64), oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl Rpc {
    pub fn new(connections: Arc<ConnectionManager>, timeout: Duration) -> Self {
        Rpc { connections, pending: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1), timeout }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<(Id, u64), oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, peer: &Id, envelope: Envelope) -> Result<()> {
        let options = SendOptions { timeout: Some(self.timeout), ..SendOptions::protocol(envelope.kind()) };
        let _ = self.connections.send(peer, envelope.to_bytes()?, options).await?;
        Ok(())
    }

    /// Sends `request` to `peer` and waits for the correlated response.
    pub async fn request(&self, peer: Id, request: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = self.pending().insert((peer, id), tx);

        if let Err(err) = self.send(&peer, Envelope::Request { id, request }).await {
            let _ = self.pending().remove(&(peer, id));
            return Err(err);
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::EmptyResponse),
            Err(_) => {
                let _ = self.pending().remove(&(peer, id));
                Err(Error::Timeout)
            }
        }
    }

    pub async fn notify(&self, peer: Id, request: Request) -> Result<()> {
        self.send(&peer, Envelope::Notify(request)).await
    }

    pub async fn respond(&self, peer: Id, id: u64, response: Response) -> Result<()> {
        self.send(&peer, Envelope::Response { id, response }).await
    }

    /// Completes waiting requests with inbound responses; returns inbound requests.
    pub fn dispatch(&self, delivery: &Delivery) -> Result<Option<Incoming>> {
        if delivery.encoding != Encoding::Bincode {
            return Ok(None);
        }
        match Envelope::from_bytes(&delivery.payload)? {
            Envelope::Request { id, request } => {
                Ok(Some(Incoming { from: delivery.from, reply_to: Some(id), request }))
            }
            Envelope::Notify(request) => Ok(Some(Incoming { from: delivery.from, reply_to: None, request })),
            Envelope::Response { id, response } => {
                match self.pending().remove(&(delivery.from, id)) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!("late response {} from {}", id, delivery.from),
                }
                Ok(None)
            }
        }
    }

    /// Requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvent, ConnectionSettings};
    use crate::crypto::{CryptoGuard, LocalIdentity, MemoryKeyStore, RateLimitSettings};
    use crate::transport::TransportSettings;

    use tokio::sync::mpsc;

    fn endpoint() -> (Arc<Rpc>, mpsc::Receiver<Delivery>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let identity = Arc::new(LocalIdentity::generate());
        let guard = Arc::new(CryptoGuard::new(identity, RateLimitSettings::default()));
        let (deliver_tx, deliveries) = mpsc::channel(16);
        let (event_tx, events) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            guard,
            Arc::new(MemoryKeyStore::new()),
            ConnectionSettings::default(),
            TransportSettings::default(),
            deliver_tx,
            event_tx,
        );
        (Arc::new(Rpc::new(Arc::new(manager), Duration::from_millis(300))), deliveries, events)
    }

    #[actix_rt::test]
    async fn request_is_answered() {
        let (a, mut a_in, _a_events) = endpoint();
        let (b, mut b_in, _b_events) = endpoint();
        let (left, right) = tokio::io::duplex(64 * 1024);
        let b_id = b.connections().local_id();
        let (x, y) = tokio::join!(
            a.connections().establish(left, None, Some(b_id), true),
            b.connections().establish(right, None, None, false),
        );
        x.unwrap();
        y.unwrap();

        // b answers every request with Ack
        let responder = b.clone();
        actix_rt::spawn(async move {
            while let Some(delivery) = b_in.recv().await {
                if let Ok(Some(incoming)) = responder.dispatch(&delivery) {
                    if let Some(id) = incoming.reply_to {
                        let _ = responder.respond(incoming.from, id, Response::Ack).await;
                    }
                }
            }
        });
        let dispatcher = a.clone();
        actix_rt::spawn(async move {
            while let Some(delivery) = a_in.recv().await {
                let _ = dispatcher.dispatch(&delivery);
            }
        });

        let service = crate::registry::ServiceInfo::new("auth", "1", vec!["127.0.0.1:1".parse().unwrap()]);
        match a.request(b_id, Request::Announce(service)).await {
            Ok(Response::Ack) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.in_flight(), 0);
    }

    #[actix_rt::test]
    async fn unanswered_request_times_out() {
        let (a, _a_in, _a_events) = endpoint();
        let (b, _b_in, _b_events) = endpoint();
        let (left, right) = tokio::io::duplex(64 * 1024);
        let b_id = b.connections().local_id();
        let (x, y) = tokio::join!(
            a.connections().establish(left, None, Some(b_id), true),
            b.connections().establish(right, None, None, false),
        );
        x.unwrap();
        y.unwrap();

        let sync = Request::Sync(crate::sync::SyncRequest::State);
        assert!(matches!(a.request(b_id, sync).await, Err(Error::Timeout)));
        assert_eq!(a.in_flight(), 0);
        assert!(matches!(
            a.request(Id::one(), Request::Sync(crate::sync::SyncRequest::State)).await,
            Err(Error::NotConnected(_))
        ));
    }
}

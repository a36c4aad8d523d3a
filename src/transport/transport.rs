use super::chunker::{compress, decompress, split};
use super::reassembly::Reassembler;
use super::{Control, Delivery, SendOptions, TransportSettings};

use crate::crypto::{CryptoGuard, SecurityFault, SessionKey};
use crate::flow::{FlowController, Permit};
use crate::message::{ChunkInfo, Compression, Encoding, Flags, Message, MessageType, MAX_PAYLOAD_SIZE};
use crate::zfx_id::Id;
use crate::{Error, Result};

use ed25519_dalek::PublicKey;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Room left in a chunk for the nonce and tag of an encrypted payload.
const CIPHER_OVERHEAD: usize = 64;

/// What the connection should do after an inbound message was processed.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Handled,
    Heartbeat,
    Close(String),
}

/// Everything needed to (re)transmit a message from scratch.
#[derive(Clone)]
struct Outgoing {
    message_id: Id,
    kind: MessageType,
    flags: Flags,
    encoding: Encoding,
    compression: Compression,
    body: Arc<Vec<u8>>,
}

struct Retained {
    outgoing: Outgoing,
    stored: Instant,
}

#[derive(Default)]
struct TransportState {
    pending_acks: HashMap<Id, oneshot::Sender<Result<()>>>,
    resend: HashMap<Id, Retained>,
    delivered: HashMap<(Id, Id), Instant>,
}

/// The transport of one established connection.
pub struct Transport {
    peer: Id,
    peer_key: PublicKey,
    guard: Arc<CryptoGuard>,
    session: Option<SessionKey>,
    chunk_size: usize,
    settings: TransportSettings,
    flow: Arc<FlowController>,
    outbound: mpsc::Sender<Message>,
    deliveries: mpsc::Sender<Delivery>,
    reassembler: Mutex<Reassembler>,
    state: Mutex<TransportState>,
}

impl Transport {
    pub fn new(
        peer: Id,
        peer_key: PublicKey,
        guard: Arc<CryptoGuard>,
        session: Option<SessionKey>,
        chunk_size: usize,
        settings: TransportSettings,
        outbound: mpsc::Sender<Message>,
        deliveries: mpsc::Sender<Delivery>,
    ) -> Self {
        let chunk_size = chunk_size.max(1).min(MAX_PAYLOAD_SIZE - CIPHER_OVERHEAD);
        let reassembler = Reassembler::new(
            settings.reassembly_timeout(),
            settings.max_payload_size,
            chunk_size,
            settings.max_partial_messages,
        );
        Transport {
            peer,
            peer_key,
            guard,
            session,
            chunk_size,
            flow: Arc::new(FlowController::new(settings.window_size)),
            settings,
            outbound,
            deliveries,
            reassembler: Mutex::new(reassembler),
            state: Mutex::new(TransportState::default()),
        }
    }

    pub fn peer(&self) -> Id {
        self.peer
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reassembler(&self) -> MutexGuard<'_, Reassembler> {
        self.reassembler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `payload` to the peer and returns its message id.
    ///
    /// Without `require_ack` this completes once every chunk has been handed to the
    /// connection's writer; with it, once the peer acknowledged the complete message. On
    /// failure or cancellation the message is abandoned: its budget is returned and no
    /// acknowledgement or resend state is left behind.
    pub async fn send(&self, payload: Vec<u8>, options: SendOptions) -> Result<Id> {
        if payload.len() > self.settings.max_payload_size {
            return Err(Error::MalformedMessage("payload exceeds maximum size"));
        }
        let cancel = options.cancel.clone().unwrap_or_default();
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let (body, compression) = if options.compress {
            (compress(&payload)?, Compression::Deflate)
        } else {
            (payload, Compression::None)
        };
        let outgoing = Outgoing {
            message_id: Id::generate(),
            kind: options.kind,
            flags: Flags {
                encrypted: options.encrypt,
                compressed: options.compress,
                priority: options.priority,
                retryable: options.retryable,
                ack_requested: options.require_ack,
            },
            encoding: options.encoding,
            compression,
            body: Arc::new(body),
        };
        let message_id = outgoing.message_id;

        let mut permit = self.flow.acquire(outgoing.body.len(), options.priority, &cancel, deadline).await?;

        let ack = if options.require_ack {
            let (tx, rx) = oneshot::channel();
            self.state().pending_acks.insert(message_id, tx);
            Some(rx)
        } else {
            None
        };
        if options.retryable {
            let retained = Retained { outgoing: outgoing.clone(), stored: Instant::now() };
            self.state().resend.insert(message_id, retained);
        }

        let result = self.deliver(&outgoing, &mut permit, ack, &cancel, deadline).await;
        let mut state = self.state();
        state.pending_acks.remove(&message_id);
        if result.is_err() || options.require_ack {
            state.resend.remove(&message_id);
        }
        drop(state);
        result.map(|()| message_id)
    }

    async fn deliver(
        &self,
        outgoing: &Outgoing,
        permit: &mut Permit,
        ack: Option<oneshot::Receiver<Result<()>>>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let best_effort = ack.is_none();
        self.transmit(outgoing, Some(permit).filter(|_| best_effort), cancel).await?;
        let ack = match ack {
            Some(ack) => ack,
            None => return Ok(()),
        };
        let ack_deadline = Instant::now() + self.settings.ack_timeout();
        let ack_deadline = deadline.map_or(ack_deadline, |deadline| deadline.min(ack_deadline));
        tokio::select! {
            acked = tokio::time::timeout_at(ack_deadline, ack) => match acked {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::ConnectionClosed(self.peer)),
                Err(_) => {
                    debug!("no ack for {} from {}", outgoing.message_id, self.peer);
                    Err(Error::AckTimeout(outgoing.message_id))
                }
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Secures and queues every chunk of `outgoing`. Budget is released per chunk when a
    /// permit is given.
    async fn transmit(
        &self,
        outgoing: &Outgoing,
        mut permit: Option<&mut Permit>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunks = split(&outgoing.body, self.chunk_size);
        let count = chunks.len() as u32;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut message = Message::new(outgoing.kind, self.guard.identity().id(), self.peer, chunk.to_vec());
            message.message_id = outgoing.message_id;
            message.flags = outgoing.flags;
            message.encoding = outgoing.encoding;
            message.compression = outgoing.compression;
            message.chunk = ChunkInfo { index: index as u32, count };
            let message = self.guard.secure(message, self.session.as_ref())?;
            tokio::select! {
                sent = self.outbound.send(message) => {
                    sent.map_err(|_| Error::ConnectionClosed(self.peer))?
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
            if let Some(permit) = permit.as_mut() {
                permit.release(chunk.len());
            }
        }
        Ok(())
    }

    /// Sends a signed CONTROL message outside of flow control.
    pub async fn send_control(&self, control: Control) -> Result<()> {
        let payload = bincode::serialize(&control)?;
        let mut message = Message::new(MessageType::Control, self.guard.identity().id(), self.peer, payload);
        message.encoding = Encoding::Bincode;
        message.flags.priority = crate::message::Priority::High;
        let message = self.guard.secure(message, None)?;
        self.outbound.send(message).await.map_err(|_| Error::ConnectionClosed(self.peer))
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let message = Message::heartbeat(self.guard.identity().id(), self.peer);
        let message = self.guard.secure(message, None)?;
        self.outbound.send(message).await.map_err(|_| Error::ConnectionClosed(self.peer))
    }

    /// Processes one inbound message from the peer.
    pub async fn receive(&self, message: Message) -> Result<Inbound> {
        if message.sender != self.peer {
            warn!("message from {} on the connection to {}", message.sender, self.peer);
            return Err(SecurityFault::UnknownSender.into());
        }
        self.guard.admit(&message.sender)?;
        match message.kind {
            MessageType::Unknown(code) => {
                debug!("ignoring message of unknown type {} from {}", code, self.peer);
                Ok(Inbound::Handled)
            }
            MessageType::Handshake => Err(Error::ProtocolViolation("handshake on established connection")),
            MessageType::Heartbeat => {
                let message = self.guard.open(message, &self.peer_key, None)?;
                self.check_fresh(&message)?;
                Ok(Inbound::Heartbeat)
            }
            MessageType::Control => {
                let message = self.guard.open(message, &self.peer_key, self.session.as_ref())?;
                self.check_fresh(&message)?;
                let control: Control = bincode::deserialize(&message.payload)?;
                self.handle_control(control).await
            }
            MessageType::Data | MessageType::Sync => {
                let message = self.guard.open(message, &self.peer_key, self.session.as_ref())?;
                self.check_fresh(&message)?;
                let assembled = self.reassembler().insert(message, std::time::Instant::now())?;
                match assembled {
                    Some(message) => self.complete(message).await,
                    None => Ok(Inbound::Handled),
                }
            }
        }
    }

    /// The timestamp is covered by the signature, so this runs after `open`.
    fn check_fresh(&self, message: &Message) -> Result<()> {
        if message.is_stale(self.settings.max_message_age()) {
            warn!("stale message {} from {}", message.message_id, self.peer);
            return Err(SecurityFault::StaleMessage.into());
        }
        Ok(())
    }

    async fn handle_control(&self, control: Control) -> Result<Inbound> {
        match control {
            Control::Ack { message_id } => {
                let mut state = self.state();
                state.resend.remove(&message_id);
                if let Some(waiter) = state.pending_acks.remove(&message_id) {
                    let _ = waiter.send(Ok(()));
                }
                Ok(Inbound::Handled)
            }
            Control::Incomplete { message_id } => {
                if let Some(waiter) = self.state().pending_acks.remove(&message_id) {
                    debug!("{} discarded {} before it was complete", self.peer, message_id);
                    let _ = waiter.send(Err(Error::ReassemblyTimeout(message_id)));
                }
                Ok(Inbound::Handled)
            }
            Control::Resend { message_id } => {
                let retained = self.state().resend.get(&message_id).map(|r| r.outgoing.clone());
                match retained {
                    Some(outgoing) => {
                        info!("resending {} to {}", message_id, self.peer);
                        self.transmit(&outgoing, None, &CancellationToken::new()).await?;
                    }
                    None => debug!("resend of unknown message {} requested", message_id),
                }
                Ok(Inbound::Handled)
            }
            Control::Close { reason } => Ok(Inbound::Close(reason)),
        }
    }

    async fn complete(&self, message: Message) -> Result<Inbound> {
        let key = (message.sender, message.message_id);
        let duplicate = self.state().delivered.contains_key(&key);
        if !duplicate {
            let payload = match message.compression {
                Compression::Deflate => decompress(&message.payload, self.settings.max_payload_size)?,
                Compression::None => message.payload,
            };
            self.state().delivered.insert(key, Instant::now());
            let delivery = Delivery {
                from: message.sender,
                message_id: message.message_id,
                kind: message.kind,
                encoding: message.encoding,
                payload,
            };
            if self.deliveries.send(delivery).await.is_err() {
                debug!("delivery channel closed, dropping {}", message.message_id);
            }
        } else {
            debug!("duplicate {} from {}", message.message_id, message.sender);
        }
        if message.flags.ack_requested {
            self.send_control(Control::Ack { message_id: message.message_id }).await?;
        }
        Ok(Inbound::Handled)
    }

    /// Expires partial messages (asking for a resend where allowed) and prunes retained
    /// state and rate limiter buckets.
    pub async fn maintain(&self) -> Result<()> {
        let expired = self.reassembler().expire(std::time::Instant::now());
        for expired in expired {
            warn!("discarding incomplete message {} from {}", expired.message_id, expired.sender);
            if expired.retryable {
                self.send_control(Control::Resend { message_id: expired.message_id }).await?;
            } else if expired.ack_requested {
                self.send_control(Control::Incomplete { message_id: expired.message_id }).await?;
            }
        }
        let window = self.settings.dedup_window();
        let now = Instant::now();
        let mut state = self.state();
        state.delivered.retain(|_, at| now.saturating_duration_since(*at) < window);
        state.resend.retain(|_, retained| now.saturating_duration_since(retained.stored) < window);
        drop(state);
        self.guard.prune();
        Ok(())
    }

    /// Fails every outstanding acknowledgement wait.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.pending_acks.clear();
        state.resend.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherSuite, LocalIdentity, RateLimitSettings};
    use crate::message::Priority;
    use std::time::Duration;

    struct Pair {
        a: Arc<Transport>,
        b: Arc<Transport>,
        a_out: mpsc::Receiver<Message>,
        b_out: mpsc::Receiver<Message>,
        a_in: mpsc::Receiver<Delivery>,
        b_in: mpsc::Receiver<Delivery>,
    }

    fn pair(settings: TransportSettings, chunk_size: usize) -> Pair {
        let a_id = Arc::new(LocalIdentity::generate());
        let b_id = Arc::new(LocalIdentity::generate());
        let session = SessionKey::derive(&[1u8; 32], CipherSuite::XChaCha20Poly1305, b"t");
        let (a_tx, a_out) = mpsc::channel(1024);
        let (b_tx, b_out) = mpsc::channel(1024);
        let (a_deliver, a_in) = mpsc::channel(16);
        let (b_deliver, b_in) = mpsc::channel(16);
        let a = Transport::new(
            b_id.id(),
            b_id.public_key(),
            Arc::new(CryptoGuard::new(a_id.clone(), RateLimitSettings::default())),
            Some(session.clone()),
            chunk_size,
            settings.clone(),
            a_tx,
            a_deliver,
        );
        let b = Transport::new(
            a_id.id(),
            a_id.public_key(),
            Arc::new(CryptoGuard::new(b_id, RateLimitSettings::default())),
            Some(session),
            chunk_size,
            settings,
            b_tx,
            b_deliver,
        );
        Pair { a: Arc::new(a), b: Arc::new(b), a_out, b_out, a_in, b_in }
    }

    async fn pump(from: &mut mpsc::Receiver<Message>, to: &Transport) -> Vec<Inbound> {
        let mut results = vec![];
        while let Ok(message) = from.try_recv() {
            results.push(to.receive(message).await.unwrap());
        }
        results
    }

    #[actix_rt::test]
    async fn chunked_compressed_encrypted_delivery() {
        let mut p = pair(TransportSettings::default(), 100);
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 7) as u8).collect();
        let options = SendOptions { compress: true, encrypt: true, ..SendOptions::default() };
        let id = p.a.send(payload.clone(), options).await.unwrap();
        assert_eq!(p.a.flow().current_load(), 0);
        pump(&mut p.a_out, &p.b).await;
        let delivery = p.b_in.try_recv().unwrap();
        assert_eq!(delivery.message_id, id);
        assert_eq!(delivery.from, p.a.guard.identity().id());
        assert_eq!(delivery.payload, payload);
    }

    #[actix_rt::test]
    async fn ack_completes_send_and_duplicates_are_not_redelivered() {
        let mut p = pair(TransportSettings::default(), 1024);
        let a = p.a.clone();
        let sending = tokio::spawn(async move {
            let options = SendOptions { require_ack: true, priority: Priority::High, ..SendOptions::default() };
            a.send(b"ping".to_vec(), options).await
        });
        let message = p.a_out.recv().await.unwrap();
        p.b.receive(message.clone()).await.unwrap();
        p.b.receive(message).await.unwrap();
        assert_eq!(p.b_in.try_recv().unwrap().payload, b"ping".to_vec());
        assert!(p.b_in.try_recv().is_err());

        // Both copies were acknowledged; the second ack is ignored.
        pump(&mut p.b_out, &p.a).await;
        assert!(sending.await.unwrap().is_ok());
        assert!(p.a_in.try_recv().is_err());
    }

    #[actix_rt::test]
    async fn missing_ack_times_out() {
        let settings = TransportSettings { ack_timeout_ms: 30, ..TransportSettings::default() };
        let p = pair(settings, 1024);
        let options = SendOptions { require_ack: true, retryable: true, ..SendOptions::default() };
        match p.a.send(b"lost".to_vec(), options).await {
            Err(e @ Error::AckTimeout(_)) => assert!(e.is_retryable()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.a.state().pending_acks.is_empty());
        assert!(p.a.state().resend.is_empty());
        assert_eq!(p.a.flow().current_load(), 0);
    }

    #[actix_rt::test]
    async fn expired_partial_asks_for_resend() {
        let settings = TransportSettings { reassembly_timeout_ms: 0, ..TransportSettings::default() };
        let mut p = pair(settings, 10);
        let options = SendOptions { retryable: true, ..SendOptions::default() };
        let id = p.a.send(vec![9u8; 35], options).await.unwrap();

        // Only the first chunk makes it.
        let first = p.a_out.recv().await.unwrap();
        while p.a_out.try_recv().is_ok() {}
        p.b.receive(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        p.b.maintain().await.unwrap();

        let resend = p.b_out.try_recv().unwrap();
        assert_eq!(resend.kind, MessageType::Control);
        p.a.receive(resend).await.unwrap();

        // The whole message is replayed from scratch and reassembles.
        let replayed: Vec<Message> = std::iter::from_fn(|| p.a_out.try_recv().ok()).collect();
        assert_eq!(replayed.len(), 4);
        for message in replayed {
            p.b.receive(message).await.unwrap();
        }
        let delivery = p.b_in.try_recv().unwrap();
        assert_eq!(delivery.message_id, id);
        assert_eq!(delivery.payload, vec![9u8; 35]);
    }

    #[actix_rt::test]
    async fn acked_send_fails_when_receiver_gives_up() {
        let settings = TransportSettings { reassembly_timeout_ms: 0, ..TransportSettings::default() };
        let mut p = pair(settings, 10);
        let a = p.a.clone();
        let sending = tokio::spawn(async move {
            let options = SendOptions { require_ack: true, ..SendOptions::default() };
            a.send(vec![3u8; 35], options).await
        });

        let first = p.a_out.recv().await.unwrap();
        let id = first.message_id;
        p.b.receive(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        p.b.maintain().await.unwrap();
        pump(&mut p.b_out, &p.a).await;

        match sending.await.unwrap() {
            Err(e @ Error::ReassemblyTimeout(_)) => {
                assert!(e.is_retryable());
                assert!(matches!(e, Error::ReassemblyTimeout(m) if m == id));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.a.state().pending_acks.is_empty());
        assert!(p.b_in.try_recv().is_err());
    }

    #[actix_rt::test]
    async fn close_and_unknown_types() {
        let mut p = pair(TransportSettings::default(), 1024);
        p.a.send_control(Control::Close { reason: "bye".into() }).await.unwrap();
        assert_eq!(pump(&mut p.a_out, &p.b).await, vec![Inbound::Close("bye".into())]);

        let unknown = Message::new(MessageType::Unknown(77), p.a.guard.identity().id(), p.b.guard.identity().id(), vec![]);
        assert_eq!(p.b.receive(unknown).await.unwrap(), Inbound::Handled);

        let stranger = Message::new(MessageType::Data, Id::generate(), p.b.guard.identity().id(), vec![]);
        assert!(p.b.receive(stranger).await.unwrap_err().is_security_fault());
    }

    #[actix_rt::test]
    async fn stale_messages_are_dropped() {
        let mut p = pair(TransportSettings { max_message_age_ms: 1_000, ..TransportSettings::default() }, 1024);
        let (a_id, b_id) = (p.a.guard.identity().id(), p.b.guard.identity().id());

        let mut old = Message::new(MessageType::Data, a_id, b_id, b"old".to_vec());
        old.timestamp = tai64::Tai64N(tai64::Tai64::from_unix(0), 0);
        let old = p.a.guard.secure(old, None).unwrap();
        match p.b.receive(old).await {
            Err(e @ Error::Security(SecurityFault::StaleMessage)) => assert!(!e.is_retryable()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.b_in.try_recv().is_err());

        let mut beat = Message::heartbeat(a_id, b_id);
        beat.timestamp = tai64::Tai64N(tai64::Tai64::from_unix(0), 0);
        let beat = p.a.guard.secure(beat, None).unwrap();
        assert!(matches!(p.b.receive(beat).await, Err(Error::Security(SecurityFault::StaleMessage))));

        let fresh = p.a.guard.secure(Message::new(MessageType::Data, a_id, b_id, b"new".to_vec()), None).unwrap();
        assert_eq!(p.b.receive(fresh).await.unwrap(), Inbound::Handled);
        assert_eq!(p.b_in.try_recv().unwrap().payload, b"new".to_vec());
    }

    #[actix_rt::test]
    async fn cancelled_send_is_abandoned() {
        let settings = TransportSettings { window_size: 10, ..TransportSettings::default() };
        let p = pair(settings, 1024);
        let _held = p.a.flow().try_acquire(10, Priority::Normal).unwrap();
        let cancel = CancellationToken::new();
        let options = SendOptions { cancel: Some(cancel.clone()), retryable: true, ..SendOptions::default() };
        let a = p.a.clone();
        let sending = tokio::spawn(async move { a.send(vec![1u8; 5], options).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(matches!(sending.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(p.a.flow().queued(), 0);
        assert!(p.a.state().resend.is_empty());
    }
}

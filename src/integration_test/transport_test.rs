use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionSettings};
use crate::crypto::{CryptoGuard, LocalIdentity, MemoryKeyStore, RateLimitSettings};
use crate::message::{Encoding, MessageType, Priority};
use crate::transport::{Delivery, SendOptions, TransportSettings};
use crate::zfx_id::Id;
use crate::Error;

use tokio::sync::mpsc;

use std::sync::Arc;
use std::time::Duration;

struct Endpoint {
    id: Id,
    manager: Arc<ConnectionManager>,
    deliveries: mpsc::Receiver<Delivery>,
    _events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

fn endpoint(identity: LocalIdentity, keys: MemoryKeyStore, transport: TransportSettings) -> Endpoint {
    let id = identity.id();
    let guard = Arc::new(CryptoGuard::new(Arc::new(identity), RateLimitSettings::default()));
    let (deliver_tx, deliveries) = mpsc::channel(16);
    let (event_tx, events) = mpsc::unbounded_channel();
    let manager = ConnectionManager::new(
        guard,
        Arc::new(keys),
        ConnectionSettings::default(),
        transport,
        deliver_tx,
        event_tx,
    );
    Endpoint { id, manager: Arc::new(manager), deliveries, _events: events }
}

/// Two endpoints sharing a symmetric key, connected over an in-memory stream.
async fn pair(transport: TransportSettings) -> (Endpoint, Endpoint) {
    let (a_identity, b_identity) = (LocalIdentity::generate(), LocalIdentity::generate());
    let shared = [9u8; 32];
    let (a_keys, b_keys) = (MemoryKeyStore::new(), MemoryKeyStore::new());
    a_keys.insert_shared_key(b_identity.id(), shared);
    b_keys.insert_shared_key(a_identity.id(), shared);
    let a = endpoint(a_identity, a_keys, transport.clone());
    let b = endpoint(b_identity, b_keys, transport);

    let (left, right) = tokio::io::duplex(256 * 1024);
    let (x, y) = tokio::join!(
        a.manager.establish(left, None, Some(b.id), true),
        b.manager.establish(right, None, None, false),
    );
    assert_eq!(x.unwrap().peer(), b.id);
    assert_eq!(y.unwrap().peer(), a.id);
    (a, b)
}

#[actix_rt::test]
async fn large_encrypted_payload_arrives_whole() {
    let transport = TransportSettings { chunk_size: 4 * 1024, window_size: 32 * 1024, ..TransportSettings::default() };
    let (a, mut b) = pair(transport).await;

    // Poorly compressible, so that it really spans many chunks.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();
    let options = SendOptions {
        priority: Priority::High,
        compress: true,
        encrypt: true,
        require_ack: true,
        timeout: Some(Duration::from_secs(5)),
        ..SendOptions::default()
    };
    let message_id = a.manager.send(&b.id, payload.clone(), options).await.unwrap();

    let delivery = b.deliveries.recv().await.unwrap();
    assert_eq!(delivery.message_id, message_id);
    assert_eq!(delivery.from, a.id);
    assert_eq!(delivery.kind, MessageType::Data);
    assert_eq!(delivery.encoding, Encoding::Raw);
    assert_eq!(delivery.payload, payload);
}

#[actix_rt::test]
async fn interleaved_sends_are_all_delivered() {
    let transport = TransportSettings { chunk_size: 1024, window_size: 8 * 1024, ..TransportSettings::default() };
    let (a, mut b) = pair(transport).await;

    let sends = (0..8u8).map(|n| {
        let manager = a.manager.clone();
        let peer = b.id;
        let priority = if n % 2 == 0 { Priority::Low } else { Priority::High };
        async move {
            let options = SendOptions { priority, require_ack: true, ..SendOptions::default() };
            manager.send(&peer, vec![n; 5_000], options).await
        }
    });
    for result in futures::future::join_all(sends).await {
        assert!(result.is_ok());
    }

    let mut seen = vec![];
    for _ in 0..8 {
        let delivery = b.deliveries.recv().await.unwrap();
        assert_eq!(delivery.payload.len(), 5_000);
        assert!(delivery.payload.iter().all(|byte| *byte == delivery.payload[0]));
        seen.push(delivery.payload[0]);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..8u8).collect::<Vec<_>>());
}

#[actix_rt::test]
async fn oversized_payload_is_refused() {
    let transport = TransportSettings { max_payload_size: 1024, ..TransportSettings::default() };
    let (a, b) = pair(transport).await;
    match a.manager.send(&b.id, vec![0u8; 2048], SendOptions::default()).await {
        Err(Error::MalformedMessage(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
}

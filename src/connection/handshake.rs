//! Mutual authentication and parameter negotiation.
//!
//! Both sides send a `Hello` and then a `Proof`, a signature over the challenge of the
//! other side. Neither side waits for the other to speak first.
use crate::channel::Channel;
use crate::crypto::{verify, CipherSuite, CryptoGuard, KeyStore, SessionKey};
use crate::message::{major_version, Encoding, Message, MessageType, PROTOCOL_VERSION};
use crate::zfx_id::Id;
use crate::{Error, Result};

use ed25519_dalek::PublicKey;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

const PROOF_CONTEXT: &[u8] = b"zfx-mesh handshake proof";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u16,
    pub node_id: Id,
    pub public_key: [u8; 32],
    pub cipher_suites: Vec<CipherSuite>,
    pub max_chunk_size: u32,
    pub challenge: [u8; 32],
}

impl Hello {
    pub fn new(guard: &CryptoGuard, max_chunk_size: usize) -> Hello {
        let identity = guard.identity();
        Hello {
            version: PROTOCOL_VERSION,
            node_id: identity.id(),
            public_key: identity.public_key().to_bytes(),
            cipher_suites: CipherSuite::supported(),
            max_chunk_size: max_chunk_size as u32,
            challenge: rand::thread_rng().gen(),
        }
    }

    /// Checks the hello on its own and returns the sender's verification key.
    pub fn validate(&self, expected: Option<Id>) -> Result<PublicKey> {
        if major_version(self.version) != major_version(PROTOCOL_VERSION) {
            return Err(Error::HandshakeFailed(format!("unsupported version {:#06x}", self.version)));
        }
        let key = PublicKey::from_bytes(&self.public_key)
            .map_err(|_| Error::HandshakeFailed("invalid public key".to_string()))?;
        if Id::from_public_key(&key) != self.node_id {
            return Err(Error::HandshakeFailed("node id does not match public key".to_string()));
        }
        match expected {
            Some(expected) if expected != self.node_id => {
                Err(Error::HandshakeFailed(format!("expected {} but reached {}", expected, self.node_id)))
            }
            _ => Ok(key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum HandshakeFrame {
    Hello(Hello),
    Proof(Proof),
}

/// Parameters both sides agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub version: u16,
    pub cipher_suite: CipherSuite,
    pub chunk_size: usize,
}

/// Lower version, the smaller chunk size and the first suite both sides support in the
/// preference order of the side with the lower node id. Either side computes the same result.
pub fn negotiate(local: &Hello, remote: &Hello) -> Result<SessionParams> {
    let (preferred, other) = if local.node_id < remote.node_id { (local, remote) } else { (remote, local) };
    let cipher_suite = preferred
        .cipher_suites
        .iter()
        .find(|suite| other.cipher_suites.contains(suite))
        .cloned()
        .ok_or_else(|| Error::HandshakeFailed("no common cipher suite".to_string()))?;
    let chunk_size = local.max_chunk_size.min(remote.max_chunk_size) as usize;
    if chunk_size == 0 {
        return Err(Error::HandshakeFailed("zero chunk size".to_string()));
    }
    Ok(SessionParams { version: local.version.min(remote.version), cipher_suite, chunk_size })
}

fn proof_bytes(challenge: &[u8; 32], prover: &Id, verifier: &Id) -> Vec<u8> {
    let mut bytes = PROOF_CONTEXT.to_vec();
    bytes.extend_from_slice(challenge);
    bytes.extend_from_slice(prover.as_bytes());
    bytes.extend_from_slice(verifier.as_bytes());
    bytes
}

/// Both challenges ordered by node id, so both sides derive the same session key.
fn transcript(local: &Hello, remote: &Hello) -> Vec<u8> {
    let (first, second) = if local.node_id < remote.node_id { (local, remote) } else { (remote, local) };
    let mut bytes = first.challenge.to_vec();
    bytes.extend_from_slice(&second.challenge);
    bytes
}

pub struct Outcome {
    pub peer: Id,
    pub peer_key: PublicKey,
    pub params: SessionParams,
    pub session: Option<SessionKey>,
}

async fn send_frame<S: AsyncRead + AsyncWrite>(
    channel: &mut Channel<S>,
    guard: &CryptoGuard,
    receiver: Id,
    frame: &HandshakeFrame,
) -> Result<()> {
    let mut message =
        Message::new(MessageType::Handshake, guard.identity().id(), receiver, bincode::serialize(frame)?);
    message.encoding = Encoding::Bincode;
    let message = guard.secure(message, None)?;
    channel.send(message).await
}

async fn recv_frame<S: AsyncRead + AsyncWrite>(channel: &mut Channel<S>) -> Result<(Message, HandshakeFrame)> {
    let message = channel
        .recv()
        .await?
        .ok_or_else(|| Error::HandshakeFailed("stream closed during handshake".to_string()))?;
    if message.kind != MessageType::Handshake {
        return Err(Error::HandshakeFailed(format!("unexpected {:?} during handshake", message.kind)));
    }
    let frame = bincode::deserialize(&message.payload)?;
    Ok((message, frame))
}

/// Runs the handshake on a fresh channel. `expected` is the peer id an outbound
/// connection was opened for.
pub async fn perform<S: AsyncRead + AsyncWrite>(
    channel: &mut Channel<S>,
    guard: &CryptoGuard,
    keys: &dyn KeyStore,
    max_chunk_size: usize,
    expected: Option<Id>,
) -> Result<Outcome> {
    let local_id = guard.identity().id();
    let hello = Hello::new(guard, max_chunk_size);
    send_frame(channel, guard, expected.unwrap_or_else(Id::zero), &HandshakeFrame::Hello(hello.clone())).await?;

    let (message, remote) = match recv_frame(channel).await? {
        (message, HandshakeFrame::Hello(remote)) => (message, remote),
        _ => return Err(Error::HandshakeFailed("expected hello".to_string())),
    };
    let peer_key = remote.validate(expected)?;
    if remote.node_id == local_id {
        return Err(Error::HandshakeFailed("connected to self".to_string()));
    }
    guard.open(message, &peer_key, None)?;
    let params = negotiate(&hello, &remote)?;

    let signature = guard.identity().sign(&proof_bytes(&remote.challenge, &local_id, &remote.node_id));
    let proof = Proof { signature: signature.to_bytes().to_vec() };
    send_frame(channel, guard, remote.node_id, &HandshakeFrame::Proof(proof)).await?;

    let (message, proof) = match recv_frame(channel).await? {
        (message, HandshakeFrame::Proof(proof)) => (message, proof),
        _ => return Err(Error::HandshakeFailed("expected proof".to_string())),
    };
    guard.open(message, &peer_key, None)?;
    if !verify(&peer_key, &proof_bytes(&hello.challenge, &remote.node_id, &local_id), &proof.signature) {
        return Err(Error::HandshakeFailed("invalid proof".to_string()));
    }

    keys.learn_public_key(remote.node_id, peer_key);
    let session = keys
        .shared_key(&remote.node_id)
        .map(|shared| SessionKey::derive(&shared, params.cipher_suite, &transcript(&hello, &remote)));
    Ok(Outcome { peer: remote.node_id, peer_key, params, session })
}

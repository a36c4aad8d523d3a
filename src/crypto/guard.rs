use super::cipher::{CipherSuite, NonceSource};
use super::keys::{verify, LocalIdentity};
use super::rate_limit::{RateLimitSettings, SenderRateLimiter};
use super::SecurityFault;

use crate::message::Message;
use crate::zfx_id::Id;
use crate::{Error, Result};

use ed25519_dalek::PublicKey;
use tracing::warn;

use std::sync::Arc;

const SESSION_CONTEXT: &str = "zfx-mesh 2022 session key";
const MESSAGE_CONTEXT: &str = "zfx-mesh 2022 message key";

/// Symmetric key material negotiated for one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: [u8; 32],
    pub suite: CipherSuite,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SessionKey({:?})", self.suite)
    }
}

impl SessionKey {
    /// Derives the session key from provisioned shared material and the handshake
    /// transcript, so that every connection uses a fresh key.
    pub fn derive(shared: &[u8; 32], suite: CipherSuite, transcript: &[u8]) -> SessionKey {
        let mut material = Vec::with_capacity(32 + transcript.len());
        material.extend_from_slice(shared);
        material.extend_from_slice(transcript);
        SessionKey { key: blake3::derive_key(SESSION_CONTEXT, &material), suite }
    }

    /// One key per direction: the sender and receiver are part of the derivation.
    fn message_key(&self, sender: &Id, receiver: &Id) -> [u8; 32] {
        let mut material = Vec::with_capacity(96);
        material.extend_from_slice(&self.key);
        material.extend_from_slice(sender.as_bytes());
        material.extend_from_slice(receiver.as_bytes());
        blake3::derive_key(MESSAGE_CONTEXT, &material)
    }
}

fn associated_data(message: &Message) -> Vec<u8> {
    let mut aad = Vec::with_capacity(3 * 32 + 9);
    aad.extend_from_slice(message.message_id.as_bytes());
    aad.extend_from_slice(message.sender.as_bytes());
    aad.extend_from_slice(message.receiver.as_bytes());
    aad.push(message.kind.code());
    aad.extend_from_slice(&message.chunk.index.to_be_bytes());
    aad.extend_from_slice(&message.chunk.count.to_be_bytes());
    aad
}

pub struct CryptoGuard {
    identity: Arc<LocalIdentity>,
    nonces: NonceSource,
    limiter: SenderRateLimiter,
}

impl CryptoGuard {
    pub fn new(identity: Arc<LocalIdentity>, rate_limit: RateLimitSettings) -> Self {
        CryptoGuard { identity, nonces: NonceSource::new(), limiter: SenderRateLimiter::new(rate_limit) }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Encrypts the payload when `flags.encrypted` is set, then signs header and
    /// (possibly encrypted) payload. The encrypted payload is `nonce || ciphertext`.
    pub fn secure(&self, mut message: Message, session: Option<&SessionKey>) -> Result<Message> {
        message.sender = self.identity.id();
        if message.flags.encrypted {
            let session = session.ok_or(SecurityFault::MissingKey)?;
            let key = session.message_key(&message.sender, &message.receiver);
            let nonce = self.nonces.next(session.suite);
            let aad = associated_data(&message);
            let ciphertext = session.suite.encrypt(&key, &nonce, &aad, &message.payload)?;
            let mut payload = nonce;
            payload.extend_from_slice(&ciphertext);
            message.payload = payload;
        }
        message.signature = self.identity.sign(&message.signing_bytes()).to_bytes().to_vec();
        Ok(message)
    }

    /// Verifies the signature and only then decrypts. On success the payload is plaintext.
    pub fn open(
        &self,
        mut message: Message,
        sender_key: &PublicKey,
        session: Option<&SessionKey>,
    ) -> Result<Message> {
        if !message.is_signed() {
            return Err(self.fault(&message, SecurityFault::MissingSignature));
        }
        if Id::from_public_key(sender_key) != message.sender {
            return Err(self.fault(&message, SecurityFault::UnknownSender));
        }
        if !verify(sender_key, &message.signing_bytes(), &message.signature) {
            return Err(self.fault(&message, SecurityFault::BadSignature));
        }
        if message.flags.encrypted {
            let session = match session {
                Some(session) => session,
                None => return Err(self.fault(&message, SecurityFault::MissingKey)),
            };
            let nonce_len = session.suite.nonce_len();
            if message.payload.len() < nonce_len {
                return Err(self.fault(&message, SecurityFault::DecryptionFailed));
            }
            let key = session.message_key(&message.sender, &message.receiver);
            let aad = associated_data(&message);
            let (nonce, ciphertext) = message.payload.split_at(nonce_len);
            match session.suite.decrypt(&key, nonce, &aad, ciphertext) {
                Ok(plaintext) => message.payload = plaintext,
                Err(fault) => return Err(self.fault(&message, fault)),
            }
        }
        Ok(message)
    }

    /// Takes a token from the sender's bucket.
    pub fn check_rate(&self, sender: &Id) -> bool {
        self.limiter.check(sender)
    }

    pub fn admit(&self, sender: &Id) -> Result<()> {
        if self.check_rate(sender) {
            Ok(())
        } else {
            warn!("rate limit exceeded, dropping message from {}", sender);
            Err(Error::RateLimitExceeded(*sender))
        }
    }

    pub fn prune(&self) {
        self.limiter.prune()
    }

    fn fault(&self, message: &Message, fault: SecurityFault) -> Error {
        warn!("security fault {:?} on {:?}", fault, message);
        Error::Security(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn guard() -> CryptoGuard {
        CryptoGuard::new(Arc::new(LocalIdentity::generate()), RateLimitSettings::default())
    }

    fn encrypted(guard: &CryptoGuard, payload: &[u8]) -> Message {
        let mut message =
            Message::new(MessageType::Data, guard.identity().id(), Id::two(), payload.to_vec());
        message.flags.encrypted = true;
        message
    }

    fn session() -> SessionKey {
        SessionKey::derive(&[5u8; 32], CipherSuite::ChaCha20Poly1305, b"transcript")
    }

    #[test]
    fn open_inverts_secure() {
        let guard = guard();
        let session = session();
        let secured = guard.secure(encrypted(&guard, b"hello mesh"), Some(&session)).unwrap();
        assert_ne!(secured.payload, b"hello mesh".to_vec());
        let opened = guard.open(secured, &guard.identity().public_key(), Some(&session)).unwrap();
        assert_eq!(opened.payload, b"hello mesh".to_vec());

        let plain = Message::new(MessageType::Data, Id::zero(), Id::two(), b"plain".to_vec());
        let secured = guard.secure(plain, None).unwrap();
        assert_eq!(secured.payload, b"plain".to_vec());
        assert!(guard.open(secured, &guard.identity().public_key(), None).is_ok());
    }

    #[test]
    fn any_bit_flip_fails() {
        let guard = guard();
        let session = session();
        let public = guard.identity().public_key();
        let secured = guard.secure(encrypted(&guard, b"payload bytes"), Some(&session)).unwrap();

        for i in 0..secured.payload.len() {
            let mut tampered = secured.clone();
            tampered.payload[i] ^= 0x01;
            match guard.open(tampered, &public, Some(&session)) {
                Err(Error::Security(SecurityFault::BadSignature)) => (),
                other => panic!("unexpected {:?}", other),
            }
        }
        for i in 0..secured.signature.len() {
            let mut tampered = secured.clone();
            tampered.signature[i] ^= 0x80;
            assert!(matches!(guard.open(tampered, &public, Some(&session)), Err(Error::Security(_))));
        }
    }

    #[test]
    fn wrong_session_key_fails_decryption() {
        let guard = guard();
        let secured = guard.secure(encrypted(&guard, b"x"), Some(&session())).unwrap();
        let other = SessionKey::derive(&[6u8; 32], CipherSuite::ChaCha20Poly1305, b"transcript");
        match guard.open(secured.clone(), &guard.identity().public_key(), Some(&other)) {
            Err(Error::Security(SecurityFault::DecryptionFailed)) => (),
            other => panic!("unexpected {:?}", other),
        }
        match guard.open(secured, &guard.identity().public_key(), None) {
            Err(Error::Security(SecurityFault::MissingKey)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unsigned_and_impersonated_messages_fail() {
        let guard = guard();
        let other = LocalIdentity::generate();
        let unsigned = Message::new(MessageType::Data, guard.identity().id(), Id::two(), vec![]);
        assert!(matches!(
            guard.open(unsigned, &guard.identity().public_key(), None),
            Err(Error::Security(SecurityFault::MissingSignature))
        ));
        let secured = guard.secure(Message::heartbeat(Id::zero(), Id::two()), None).unwrap();
        assert!(matches!(
            guard.open(secured, &other.public_key(), None),
            Err(Error::Security(SecurityFault::UnknownSender))
        ));
    }

    #[test]
    fn encrypting_without_key_fails() {
        let guard = guard();
        assert!(matches!(
            guard.secure(encrypted(&guard, b"x"), None),
            Err(Error::Security(SecurityFault::MissingKey))
        ));
    }

    #[test]
    fn admit_enforces_rate_limit() {
        let guard = CryptoGuard::new(
            Arc::new(LocalIdentity::generate()),
            RateLimitSettings { bucket_size: 1, refill_per_second: 1 },
        );
        assert!(guard.admit(&Id::one()).is_ok());
        assert!(matches!(guard.admit(&Id::one()), Err(Error::RateLimitExceeded(_))));
    }
}

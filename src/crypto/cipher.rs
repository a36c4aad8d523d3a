//! Authenticated ciphers used for message payloads.
use super::SecurityFault;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};

use rand::rngs::OsRng;
use rand::RngCore;

use std::sync::atomic::{AtomicU64, Ordering};

/// Authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl CipherSuite {
    /// Suites offered during the handshake, most preferred first.
    pub fn supported() -> Vec<CipherSuite> {
        vec![CipherSuite::XChaCha20Poly1305, CipherSuite::ChaCha20Poly1305]
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            CipherSuite::ChaCha20Poly1305 => 12,
            CipherSuite::XChaCha20Poly1305 => 24,
        }
    }

    pub fn encrypt(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SecurityFault> {
        let payload = Payload { msg: plaintext, aad };
        let key = Key::from_slice(key);
        let result = match self {
            CipherSuite::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(key).encrypt(Nonce::from_slice(nonce), payload)
            }
            CipherSuite::XChaCha20Poly1305 => {
                XChaCha20Poly1305::new(key).encrypt(XNonce::from_slice(nonce), payload)
            }
        };
        result.map_err(|_| SecurityFault::EncryptionFailed)
    }

    pub fn decrypt(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SecurityFault> {
        if nonce.len() != self.nonce_len() || ciphertext.len() < TAG_SIZE {
            return Err(SecurityFault::DecryptionFailed);
        }
        let payload = Payload { msg: ciphertext, aad };
        let key = Key::from_slice(key);
        let result = match self {
            CipherSuite::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(key).decrypt(Nonce::from_slice(nonce), payload)
            }
            CipherSuite::XChaCha20Poly1305 => {
                XChaCha20Poly1305::new(key).decrypt(XNonce::from_slice(nonce), payload)
            }
        };
        result.map_err(|_| SecurityFault::DecryptionFailed)
    }
}

/// Produces unique nonces: a random prefix fixed for the lifetime of the source followed
/// by a big-endian counter in the last eight bytes.
pub struct NonceSource {
    prefix: [u8; 16],
    counter: AtomicU64,
}

impl NonceSource {
    pub fn new() -> Self {
        let mut prefix = [0u8; 16];
        OsRng.fill_bytes(&mut prefix);
        NonceSource { prefix, counter: AtomicU64::new(0) }
    }

    pub fn next(&self, suite: CipherSuite) -> Vec<u8> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let prefix_len = suite.nonce_len() - 8;
        let mut nonce = Vec::with_capacity(suite.nonce_len());
        nonce.extend_from_slice(&self.prefix[..prefix_len]);
        nonce.extend_from_slice(&count.to_be_bytes());
        nonce
    }
}

impl Default for NonceSource {
    fn default() -> Self {
        NonceSource::new()
    }
}

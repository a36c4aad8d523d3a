//! Confidentiality, integrity and abuse prevention for messages.
//!
//! The [CryptoGuard] signs every outgoing message with the node's long-term key and
//! optionally encrypts its payload with a key bound to the recipient. Incoming messages
//! are verified before anything else is done with them.
mod cipher;
mod guard;
mod keys;
mod rate_limit;

pub use cipher::{CipherSuite, NonceSource, TAG_SIZE};
pub use guard::{CryptoGuard, SessionKey};
pub use keys::{verify, KeyStore, LocalIdentity, MemoryKeyStore};
pub use rate_limit::{RateLimitSettings, SenderRateLimiter};

/// Reasons a message failed security processing. None of these are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityFault {
    MissingSignature,
    BadSignature,
    EncryptionFailed,
    DecryptionFailed,
    /// No key material for the peer, so the payload can not be (de)crypted.
    MissingKey,
    /// The claimed sender does not match the verification key.
    UnknownSender,
    /// Correctly signed, but originated longer ago than the receiver accepts.
    StaleMessage,
}

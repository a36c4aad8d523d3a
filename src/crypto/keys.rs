//! Long-term identity material and the key lookup used by the guard.
use crate::zfx_id::Id;
use crate::{Error, Result};

use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::RwLock;

/// This node's signing keypair together with the id derived from it.
pub struct LocalIdentity {
    keypair: Keypair,
    id: Id,
}

impl LocalIdentity {
    pub fn new(keypair: Keypair) -> Self {
        let id = Id::from_public_key(&keypair.public);
        LocalIdentity { keypair, id }
    }

    pub fn generate() -> Self {
        LocalIdentity::new(Keypair::generate(&mut OsRng {}))
    }

    /// Parses a hex encoded 64 byte keypair (secret followed by public key).
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| Error::TryFromStringError)?;
        let keypair = Keypair::from_bytes(&bytes)?;
        Ok(LocalIdentity::new(keypair))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.keypair.to_bytes())
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.keypair.sign(bytes)
    }
}

pub fn verify(public: &PublicKey, bytes: &[u8], signature: &[u8]) -> bool {
    match Signature::try_from(signature) {
        Ok(signature) => public.verify(bytes, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Access to peer key material provisioned outside of this crate.
pub trait KeyStore: Send + Sync {
    /// The long-term verification key of `id`, if known.
    fn public_key(&self, id: &Id) -> Option<PublicKey>;

    /// The symmetric key shared with `id`, if one was provisioned.
    fn shared_key(&self, id: &Id) -> Option<[u8; 32]>;

    /// Records a public key learned through a verified handshake.
    fn learn_public_key(&self, id: Id, public: PublicKey);
}

#[derive(Default)]
pub struct MemoryKeyStore {
    public_keys: RwLock<HashMap<Id, PublicKey>>,
    shared_keys: RwLock<HashMap<Id, [u8; 32]>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        MemoryKeyStore::default()
    }

    pub fn insert_shared_key(&self, id: Id, key: [u8; 32]) {
        if let Ok(mut keys) = self.shared_keys.write() {
            keys.insert(id, key);
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn public_key(&self, id: &Id) -> Option<PublicKey> {
        self.public_keys.read().ok()?.get(id).cloned()
    }

    fn shared_key(&self, id: &Id) -> Option<[u8; 32]> {
        self.shared_keys.read().ok()?.get(id).cloned()
    }

    fn learn_public_key(&self, id: Id, public: PublicKey) {
        if let Ok(mut keys) = self.public_keys.write() {
            keys.insert(id, public);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_keypair_round_trip() {
        let identity = LocalIdentity::generate();
        let parsed = LocalIdentity::from_hex(&identity.to_hex()).unwrap();
        assert_eq!(identity.id(), parsed.id());
        assert!(LocalIdentity::from_hex("zz").is_err());
    }

    #[test]
    fn signatures_verify_against_public_key() {
        let identity = LocalIdentity::generate();
        let signature = identity.sign(b"bytes");
        assert!(verify(&identity.public_key(), b"bytes", &signature.to_bytes()));
        assert!(!verify(&identity.public_key(), b"other", &signature.to_bytes()));
        assert!(!verify(&identity.public_key(), b"bytes", &[0u8; 12]));
    }

    #[test]
    fn store_records_learned_keys() {
        let store = MemoryKeyStore::new();
        let identity = LocalIdentity::generate();
        assert!(store.public_key(&identity.id()).is_none());
        store.learn_public_key(identity.id(), identity.public_key());
        assert_eq!(store.public_key(&identity.id()), Some(identity.public_key()));
        store.insert_shared_key(Id::one(), [3u8; 32]);
        assert_eq!(store.shared_key(&Id::one()), Some([3u8; 32]));
    }
}

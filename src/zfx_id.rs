//! Hash-based identifiers for nodes, messages and lookup keys
//!
//! See the documentation of [Id] for details.

use std::convert::TryInto;
use std::fmt;
use std::str::FromStr;

use base58check::{FromBase58Check, ToBase58Check};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::PublicKey;
use rand::{self, Rng};

/// Number of bits in an `Id`, and therefore the number of routing table buckets.
pub const ID_BITS: usize = 256;

/// Generic hash-based ID used throughout the mesh
///
/// The `Id` wraps a 32-byte value. Node ids are the hash of the node's ed25519 public key,
/// message ids are random, and lookup keys are the hash of whatever is being looked up
/// (e.g. a service name).
///
/// They are displayed using the Base58check format.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Serialize, Deserialize, Default)]
pub struct Id([u8; 32]);

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_base58check(0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_base58check(0))
    }
}

impl FromStr for Id {
    type Err = crate::Error;

    /// Converts a base58check encoded string to bytes of an Id
    fn from_str(id_str: &str) -> Result<Self, crate::Error> {
        let (vsn, bytes) =
            id_str.from_base58check().map_err(|_| crate::Error::TryFromStringError)?;
        if vsn != 0 {
            return Err(crate::Error::TryFromStringError);
        }
        let bytes: [u8; 32] =
            bytes.as_slice().try_into().map_err(|_| crate::Error::TryFromStringError)?;
        Ok(Id(bytes))
    }
}

impl From<[u8; 32]> for Id {
    fn from(bytes: [u8; 32]) -> Self {
        Id(bytes)
    }
}

impl Id {
    /// By default a new id is created by hashing an input byte slice
    pub fn new(bytes: &[u8]) -> Id {
        Id(hash(bytes))
    }

    /// The node id belonging to an ed25519 public key.
    pub fn from_public_key(public: &PublicKey) -> Id {
        Id::new(public.as_bytes())
    }

    /// Generate a random `Id`
    pub fn generate() -> Id {
        let mut rng = rand::thread_rng();
        let v: [u8; 32] = rng.gen();
        Id(v)
    }

    /// All-zeroes `Id`, used as the receiver of messages addressed to nobody in particular
    pub fn zero() -> Id {
        Id([0u8; 32])
    }

    /// All-ones `Id` (for testing)
    pub fn one() -> Id {
        Id([1u8; 32])
    }

    /// All-twos `Id` (for testing)
    pub fn two() -> Id {
        Id([2u8; 32])
    }

    /// Returns the wrapped byte array
    pub fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Returns a slice to the contained byte array
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// XOR distance to another id. Distances compare lexicographically, so the returned
    /// `Id` can be ordered directly.
    pub fn distance(&self, other: &Id) -> Id {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Id(out)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// The routing table bucket `other` falls into relative to `self`, or `None` when
    /// both ids are equal. Bucket 0 is the furthest half of the id space.
    pub fn bucket_index(&self, other: &Id) -> Option<usize> {
        let zeros = self.distance(other).leading_zeros();
        if zeros >= ID_BITS {
            None
        } else {
            Some(zeros)
        }
    }
}

type Blake2b256 = Blake2b<U32>;

fn hash(input: &[u8]) -> [u8; 32] {
    Blake2b256::digest(input).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_round_trip() {
        let id = Id::generate();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-an-id".parse::<Id>().is_err());
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = Id::new(b"a");
        let b = Id::new(b"b");
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.bucket_index(&a), None);
    }

    #[test]
    fn bucket_index_counts_shared_prefix() {
        let mut near = [0u8; 32];
        near[31] = 1;
        let mut far = [0u8; 32];
        far[0] = 0x80;
        let zero = Id::zero();
        assert_eq!(zero.bucket_index(&Id::from(near)), Some(255));
        assert_eq!(zero.bucket_index(&Id::from(far)), Some(0));
    }
}

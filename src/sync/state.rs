//! Replicated network state as a last-writer-wins map.
//!
//! Every entry carries a [Tag] (lamport clock, origin node). Merging keeps the entry with the
//! larger tag per key, which makes [merge] commutative, associative and idempotent.
use crate::zfx_id::Id;
use crate::{Error, Result};

use actix_derive::MessageResponse;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub lamport: u64,
    pub origin: Id,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// `None` marks a deletion.
    pub value: Option<Vec<u8>>,
    pub tag: Tag,
}

pub type Changes = BTreeMap<String, Entry>;

/// Joins two change sets key by key, keeping the entry with the larger tag.
///
/// Two entries with the same tag must be identical; anything else means a node reused a
/// clock value and is reported as `StateConflictUnresolved`.
pub fn merge(a: &Changes, b: &Changes) -> Result<Changes> {
    let mut merged = a.clone();
    for (key, theirs) in b.iter() {
        match merged.get(key) {
            Some(ours) if ours.tag == theirs.tag => {
                if ours.value != theirs.value {
                    return Err(Error::StateConflictUnresolved(key.clone()));
                }
            }
            Some(ours) if ours.tag > theirs.tag => (),
            _ => {
                let _ = merged.insert(key.clone(), theirs.clone());
            }
        }
    }
    Ok(merged)
}

/// Entries of `new` that are absent from or different in `old`.
pub fn diff(old: &Changes, new: &Changes) -> Changes {
    new.iter().filter(|(k, v)| old.get(*k) != Some(*v)).map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Canonical content hash of a set of entries.
pub fn hash_entries(entries: &Changes) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for (key, entry) in entries.iter() {
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        match &entry.value {
            Some(value) => {
                hasher.update(&[1]);
                hasher.update(&(value.len() as u64).to_be_bytes());
                hasher.update(value);
            }
            None => {
                hasher.update(&[0]);
            }
        }
        hasher.update(&entry.tag.lamport.to_be_bytes());
        hasher.update(entry.tag.origin.as_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// The cheap summary replicas exchange to detect divergence.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, MessageResponse)]
pub struct Digest {
    pub version: u64,
    pub hash: [u8; 32],
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}:{}", self.version, hex::encode(&self.hash[..4]))
    }
}

/// One accepted update: the changes that took the state to `version`, and the hash of the
/// state after applying them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub version: u64,
    pub changes: Changes,
    pub hash: [u8; 32],
}

/// A full copy of a replica's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, MessageResponse)]
pub struct Snapshot {
    pub version: u64,
    pub hash: [u8; 32],
    pub lamport: u64,
    pub entries: Changes,
}

#[derive(Debug, Clone)]
pub struct NetworkState {
    version: u64,
    entries: Changes,
    hash: [u8; 32],
    lamport: u64,
}

impl Default for NetworkState {
    fn default() -> Self {
        NetworkState::new()
    }
}

impl NetworkState {
    pub fn new() -> Self {
        let entries = Changes::new();
        NetworkState { version: 0, hash: hash_entries(&entries), entries, lamport: 0 }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    pub fn digest(&self) -> Digest {
        Digest { version: self.version, hash: self.hash }
    }

    pub fn entries(&self) -> &Changes {
        &self.entries
    }

    /// The live value of `key`; deleted keys read as absent.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).and_then(|e| e.value.as_deref())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            hash: self.hash,
            lamport: self.lamport,
            entries: self.entries.clone(),
        }
    }

    /// Tags a local update with the next lamport time.
    pub fn prepare(&self, origin: Id, updates: Vec<(String, Option<Vec<u8>>)>) -> Changes {
        let tag = Tag { lamport: self.lamport + 1, origin };
        updates.into_iter().map(|(key, value)| (key, Entry { value, tag })).collect()
    }

    /// The delta that applying `changes` would produce, without touching the state.
    pub fn candidate(&self, changes: &Changes) -> Result<Delta> {
        let merged = merge(&self.entries, changes)?;
        Ok(Delta { version: self.version + 1, hash: hash_entries(&merged), changes: changes.clone() })
    }

    /// Merges `entries` and moves to `version`.
    fn install(&mut self, entries: Changes, version: u64) {
        let lamport = entries.values().map(|e| e.tag.lamport).max().unwrap_or(0);
        self.lamport = self.lamport.max(lamport);
        self.hash = hash_entries(&entries);
        self.entries = entries;
        self.version = version;
    }

    /// Applies changes as the next version.
    pub fn apply(&mut self, changes: &Changes) -> Result<Delta> {
        let merged = merge(&self.entries, changes)?;
        self.install(merged, self.version + 1);
        Ok(Delta { version: self.version, changes: changes.clone(), hash: self.hash })
    }

    /// Applies a remote delta for the next version, provided it leads to the hash the
    /// remote reached. Returns `false`, leaving the state untouched, when the histories
    /// have diverged.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<bool> {
        let merged = merge(&self.entries, &delta.changes)?;
        if delta.version != self.version + 1 || hash_entries(&merged) != delta.hash {
            return Ok(false);
        }
        self.install(merged, delta.version);
        Ok(true)
    }

    /// Reconciles with a replica whose history diverged from ours.
    pub fn merge_snapshot(&mut self, snapshot: &Snapshot) -> Result<Reconciled> {
        let merged = merge(&self.entries, &snapshot.entries)?;
        let hash = hash_entries(&merged);
        if hash == self.hash {
            return Ok(Reconciled::Unchanged);
        }
        if hash == snapshot.hash && snapshot.version >= self.version {
            self.install(merged, snapshot.version);
            return Ok(Reconciled::Adopted);
        }
        let changes = diff(&self.entries, &merged);
        let version = self.version.max(snapshot.version) + 1;
        self.install(merged, version);
        Ok(Reconciled::Merged(Delta { version, changes, hash }))
    }
}

/// Outcome of [NetworkState::merge_snapshot].
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Our state already contained the remote one.
    Unchanged,
    /// Our state was contained in the remote one; we now equal it.
    Adopted,
    /// Both sides had something the other lacked; the join is a new version.
    Merged(Delta),
}

/// Recent deltas, contiguous by version, so that peers that fell behind can catch up.
#[derive(Debug)]
pub struct DeltaLog {
    deltas: VecDeque<Delta>,
    /// Version of the state before the oldest kept delta.
    base: u64,
    max_len: usize,
}

impl DeltaLog {
    pub fn new(max_len: usize) -> Self {
        DeltaLog { deltas: VecDeque::new(), base: 0, max_len: max_len.max(1) }
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    fn head(&self) -> u64 {
        self.deltas.back().map(|d| d.version).unwrap_or(self.base)
    }

    pub fn push(&mut self, delta: Delta) {
        if delta.version != self.head() + 1 {
            self.reset(delta.version.saturating_sub(1));
        }
        self.deltas.push_back(delta);
        while self.deltas.len() > self.max_len {
            if let Some(oldest) = self.deltas.pop_front() {
                self.base = oldest.version;
            }
        }
    }

    /// Forgets history; the state is now at `version` with nothing to replay.
    pub fn reset(&mut self, version: u64) {
        self.deltas.clear();
        self.base = version;
    }

    /// Deltas after `version`, or `None` if some have been pruned.
    pub fn since(&self, version: u64) -> Option<Vec<Delta>> {
        if version < self.base {
            return None;
        }
        Some(self.deltas.iter().filter(|d| d.version > version).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{thread_rng, Rng};

    fn set(origin: Id, lamport: u64, pairs: &[(&str, Option<&str>)]) -> Changes {
        let tag = Tag { lamport, origin };
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Entry { value: v.map(|v| v.as_bytes().to_vec()), tag }))
            .collect()
    }

    #[test]
    fn merge_is_a_join() {
        let a = set(Id::one(), 1, &[("x", Some("1")), ("y", Some("a"))]);
        let b = set(Id::two(), 1, &[("x", Some("2")), ("z", None)]);
        let c = set(Id::one(), 2, &[("y", Some("c")), ("z", Some("c"))]);

        let ab = merge(&a, &b).unwrap();
        assert_eq!(ab, merge(&b, &a).unwrap());
        assert_eq!(
            merge(&a, &merge(&b, &c).unwrap()).unwrap(),
            merge(&merge(&a, &b).unwrap(), &c).unwrap()
        );
        assert_eq!(merge(&ab, &b).unwrap(), ab);
        assert_eq!(merge(&ab, &ab).unwrap(), ab);
        // (1, two) beats (1, one)
        assert_eq!(ab["x"].value, Some(b"2".to_vec()));
    }

    /// Same key and tag always yield the same value, as they would from a correct node.
    fn random_changes(rng: &mut impl Rng) -> Changes {
        let origins = [Id::one(), Id::two(), Id::new(&[3])];
        (0..rng.gen_range(0, 6))
            .map(|_| {
                let key = format!("k{}", rng.gen_range(0, 4));
                let origin = rng.gen_range(0, origins.len());
                let lamport = rng.gen_range(1, 4);
                let value = if (lamport as usize + origin) % 3 == 0 {
                    None
                } else {
                    Some(format!("{}/{}/{}", key, lamport, origin).into_bytes())
                };
                (key, Entry { value, tag: Tag { lamport, origin: origins[origin] } })
            })
            .collect()
    }

    #[test]
    fn merge_laws_hold_for_random_changes() {
        let mut rng = thread_rng();
        for _ in 0..500 {
            let (a, b, c) = (random_changes(&mut rng), random_changes(&mut rng), random_changes(&mut rng));
            let ab = merge(&a, &b).unwrap();
            assert_eq!(ab, merge(&b, &a).unwrap());
            assert_eq!(merge(&ab, &c).unwrap(), merge(&a, &merge(&b, &c).unwrap()).unwrap());
            assert_eq!(merge(&a, &a).unwrap(), a);
            assert_eq!(merge(&ab, &b).unwrap(), ab);
            assert_eq!(hash_entries(&merge(&ab, &c).unwrap()), hash_entries(&merge(&c, &ab).unwrap()));
            for (key, entry) in ab.iter() {
                let tags = a.get(key).into_iter().chain(b.get(key)).map(|e| e.tag);
                assert_eq!(Some(entry.tag), tags.max());
            }
        }
    }

    #[test]
    fn reused_tag_is_unresolvable() {
        let a = set(Id::one(), 1, &[("x", Some("1"))]);
        let b = set(Id::one(), 1, &[("x", Some("2"))]);
        match merge(&a, &b) {
            Err(Error::StateConflictUnresolved(key)) => assert_eq!(key, "x"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn apply_is_idempotent_on_content() {
        let mut state = NetworkState::new();
        let changes = state.prepare(Id::one(), vec![("x".to_string(), Some(b"1".to_vec()))]);
        let delta = state.apply(&changes).unwrap();
        assert_eq!(delta.version, 1);
        let hash = state.hash();
        state.apply(&changes).unwrap();
        assert_eq!(state.hash(), hash);
        assert_eq!(state.get("x"), Some(&b"1"[..]));
        assert_eq!(state.lamport(), 1);
    }

    #[test]
    fn diverged_delta_is_refused() {
        let mut a = NetworkState::new();
        let mut b = NetworkState::new();
        let delta = a.apply(&a.prepare(Id::one(), vec![("x".to_string(), None)])).unwrap();
        b.apply(&b.prepare(Id::two(), vec![("y".to_string(), None)])).unwrap();
        // b is at version 1 already; a's version 1 cannot follow it.
        assert!(!b.apply_delta(&delta).unwrap());
        let mut c = NetworkState::new();
        assert!(c.apply_delta(&delta).unwrap());
        assert_eq!(c.digest(), a.digest());
    }

    #[test]
    fn concurrent_versions_converge() {
        let mut a = NetworkState::new();
        let mut b = NetworkState::new();
        for _ in 0..4 {
            let shared = a.prepare(Id::one(), vec![("base".to_string(), Some(vec![a.version() as u8]))]);
            let delta = a.apply(&shared).unwrap();
            assert!(b.apply_delta(&delta).unwrap());
        }
        a.apply(&a.prepare(Id::one(), vec![("x".to_string(), Some(b"X".to_vec()))])).unwrap();
        b.apply(&b.prepare(Id::two(), vec![("y".to_string(), Some(b"Y".to_vec()))])).unwrap();
        assert_eq!(a.version(), 5);
        assert_eq!(b.version(), 5);
        assert_ne!(a.hash(), b.hash());

        let from_b = b.snapshot();
        let from_a = a.snapshot();
        assert!(matches!(a.merge_snapshot(&from_b).unwrap(), Reconciled::Merged(_)));
        assert!(matches!(b.merge_snapshot(&from_a).unwrap(), Reconciled::Merged(_)));
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.version(), 6);
        assert_eq!(a.get("x"), Some(&b"X"[..]));
        assert_eq!(a.get("y"), Some(&b"Y"[..]));

        // A replica that is strictly behind adopts the remote version.
        let mut behind = NetworkState::new();
        assert_eq!(behind.merge_snapshot(&a.snapshot()).unwrap(), Reconciled::Adopted);
        assert_eq!(behind.digest(), a.digest());
        assert_eq!(a.merge_snapshot(&NetworkState::new().snapshot()).unwrap(), Reconciled::Unchanged);
    }

    #[test]
    fn log_serves_recent_history() {
        let mut log = DeltaLog::new(2);
        let delta = |version| Delta { version, changes: Changes::new(), hash: [0u8; 32] };
        log.push(delta(1));
        log.push(delta(2));
        assert_eq!(log.since(0).unwrap().len(), 2);
        log.push(delta(3));
        assert!(log.since(0).is_none());
        assert_eq!(log.since(1).unwrap().iter().map(|d| d.version).collect::<Vec<_>>(), vec![2, 3]);
        assert!(log.since(3).unwrap().is_empty());
        // A gap drops everything older.
        log.push(delta(7));
        assert_eq!(log.len(), 1);
        assert!(log.since(5).is_none());
        assert_eq!(log.since(6).unwrap().len(), 1);
    }
}

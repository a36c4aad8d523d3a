use crate::message::{ChunkInfo, Message};
use crate::zfx_id::Id;
use crate::{Error, Result};

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// A partial message that was discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Expired {
    pub sender: Id,
    pub message_id: Id,
    pub retryable: bool,
    /// The sender waits for an acknowledgement that will not come.
    pub ack_requested: bool,
}

struct Partial {
    /// The first chunk received, kept as the header template of the assembled message.
    template: Message,
    count: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes: usize,
    started: Instant,
}

/// Collects chunks keyed by `(sender, message_id)`.
///
/// Memory is bounded by the number of partial messages times `max_size`: a transfer may
/// not declare more chunks than `max_size` bytes split at `chunk_size` need.
pub struct Reassembler {
    partial: HashMap<(Id, Id), Partial>,
    timeout: Duration,
    max_size: usize,
    max_chunks: u32,
    max_partials: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_size: usize, chunk_size: usize, max_partials: usize) -> Self {
        // One chunk of slack for compressed bodies that grew past `max_size`.
        let max_chunks = (max_size / chunk_size.max(1)).saturating_add(1).min(u32::MAX as usize) as u32;
        Reassembler { partial: HashMap::new(), timeout, max_size, max_chunks, max_partials }
    }

    pub fn len(&self) -> usize {
        self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }

    /// Adds a chunk. Returns the assembled message once every chunk has arrived.
    pub fn insert(&mut self, mut message: Message, now: Instant) -> Result<Option<Message>> {
        if message.chunk.is_single() {
            return Ok(Some(message));
        }
        let ChunkInfo { index, count } = message.chunk;
        if count > self.max_chunks {
            return Err(Error::MalformedMessage("too many chunks"));
        }
        let key = (message.sender, message.message_id);
        if !self.partial.contains_key(&key) && self.partial.len() >= self.max_partials {
            return Err(Error::MalformedMessage("too many partial messages"));
        }
        let max_size = self.max_size;
        let partial = self.partial.entry(key).or_insert_with(|| Partial {
            template: Message { payload: vec![], signature: vec![], ..message.clone() },
            count,
            chunks: BTreeMap::new(),
            bytes: 0,
            started: now,
        });
        if partial.count != count {
            self.partial.remove(&key);
            return Err(Error::MalformedMessage("chunk count changed"));
        }
        if partial.chunks.contains_key(&index) {
            return Ok(None);
        }
        partial.bytes += message.payload.len();
        if partial.bytes > max_size {
            self.partial.remove(&key);
            return Err(Error::MalformedMessage("reassembled message too large"));
        }
        partial.chunks.insert(index, std::mem::take(&mut message.payload));
        if partial.chunks.len() < count as usize {
            return Ok(None);
        }

        let partial = match self.partial.remove(&key) {
            Some(partial) => partial,
            None => return Ok(None),
        };
        let mut payload = Vec::with_capacity(partial.bytes);
        for chunk in partial.chunks.values() {
            payload.extend_from_slice(chunk);
        }
        let mut assembled = partial.template;
        assembled.payload = payload;
        assembled.chunk = ChunkInfo::single();
        Ok(Some(assembled))
    }

    /// Discards partial messages older than the reassembly timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let timeout = self.timeout;
        let mut expired = vec![];
        self.partial.retain(|(sender, message_id), partial| {
            if now.saturating_duration_since(partial.started) < timeout {
                return true;
            }
            expired.push(Expired {
                sender: *sender,
                message_id: *message_id,
                retryable: partial.template.flags.retryable,
                ack_requested: partial.template.flags.ack_requested,
            });
            false
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn chunks(payload: &[u8], size: usize, retryable: bool) -> Vec<Message> {
        let template = Message::new(MessageType::Data, Id::one(), Id::two(), vec![]);
        let parts = crate::transport::split(payload, size);
        let count = parts.len() as u32;
        parts
            .into_iter()
            .enumerate()
            .map(|(i, part)| {
                let mut message = template.clone();
                message.flags.retryable = retryable;
                message.chunk = ChunkInfo { index: i as u32, count };
                message.payload = part.to_vec();
                message
            })
            .collect()
    }

    #[test]
    fn reassembles_out_of_order_with_duplicates() {
        let payload: Vec<u8> = (0..100).collect();
        let mut parts = chunks(&payload, 30, false);
        parts.reverse();
        let duplicate = parts[0].clone();
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(1), 1000, 30, 8);

        let last = parts.pop().unwrap();
        for part in parts {
            assert!(reassembler.insert(part, now).unwrap().is_none());
        }
        assert!(reassembler.insert(duplicate, now).unwrap().is_none());
        let assembled = reassembler.insert(last, now).unwrap().unwrap();
        assert_eq!(assembled.payload, payload);
        assert!(assembled.chunk.is_single());
        assert!(reassembler.is_empty());
    }

    #[test]
    fn partial_messages_expire() {
        let parts = chunks(&[1u8; 50], 10, true);
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_millis(100), 1000, 10, 8);
        reassembler.insert(parts[0].clone(), now).unwrap();
        assert!(reassembler.expire(now + Duration::from_millis(50)).is_empty());
        let expired = reassembler.expire(now + Duration::from_millis(150));
        assert_eq!(
            expired,
            vec![Expired {
                sender: Id::one(),
                message_id: parts[0].message_id,
                retryable: true,
                ack_requested: false
            }]
        );
        assert!(reassembler.is_empty());
    }

    #[test]
    fn oversize_and_inconsistent_transfers_are_rejected() {
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(1), 25, 5, 8);
        let parts = chunks(&[0u8; 40], 10, false);
        reassembler.insert(parts[0].clone(), now).unwrap();
        reassembler.insert(parts[1].clone(), now).unwrap();
        assert!(reassembler.insert(parts[2].clone(), now).is_err());

        let mut reassembler = Reassembler::new(Duration::from_secs(1), 1000, 30, 8);
        reassembler.insert(parts[0].clone(), now).unwrap();
        let mut changed = parts[1].clone();
        changed.chunk.count = 7;
        assert!(matches!(reassembler.insert(changed, now), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn declared_chunk_count_is_bounded() {
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(10), 16 * 1024 * 1024, 64 * 1024, 8);
        let mut forged = Message::new(MessageType::Data, Id::one(), Id::two(), vec![1]);
        forged.chunk = ChunkInfo { index: 0, count: crate::message::codec::MAX_CHUNK_COUNT };
        assert!(matches!(reassembler.insert(forged, now), Err(Error::MalformedMessage("too many chunks"))));
        assert!(reassembler.is_empty());

        // 16 MiB in 64 KiB chunks, plus one
        let mut largest = Message::new(MessageType::Data, Id::one(), Id::two(), vec![1]);
        largest.chunk = ChunkInfo { index: 0, count: 257 };
        assert!(reassembler.insert(largest.clone(), now).unwrap().is_none());
        largest.message_id = Id::generate();
        largest.chunk.count = 258;
        assert!(reassembler.insert(largest, now).is_err());
        assert_eq!(reassembler.len(), 1);
    }

    #[test]
    fn partial_messages_are_capped() {
        let now = Instant::now();
        let mut reassembler = Reassembler::new(Duration::from_secs(10), 1000, 10, 2);
        let first = chunks(&[1u8; 30], 10, false);
        let second = chunks(&[2u8; 30], 10, false);
        let third = chunks(&[3u8; 30], 10, false);
        assert!(reassembler.insert(first[0].clone(), now).unwrap().is_none());
        assert!(reassembler.insert(second[0].clone(), now).unwrap().is_none());
        assert!(matches!(
            reassembler.insert(third[0].clone(), now),
            Err(Error::MalformedMessage("too many partial messages"))
        ));
        // Transfers already in progress still complete and free their slot.
        assert!(reassembler.insert(first[1].clone(), now).unwrap().is_none());
        assert_eq!(reassembler.insert(first[2].clone(), now).unwrap().unwrap().payload, vec![1u8; 30]);
        assert!(reassembler.insert(third[0].clone(), now).unwrap().is_none());
        assert_eq!(reassembler.len(), 2);
    }
}

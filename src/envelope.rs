// Copyright (c) 2024 Botho Foundation

//! The overlay's unit of message transfer (§3, §4.5): addressable,
//! deduplicable, TTL-bounded. Grounded on the signaling layer's
//! [`crate::signaling`] session-id pattern for the 128-bit random id and on
//! its length-prefixed wire framing.

use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::peer_id::PeerId;

pub const DEFAULT_TTL_HOPS: u8 = 5;
pub const DEFAULT_SEEN_SET_CAPACITY: usize = 4096;

/// A 128-bit envelope identifier, unique with overwhelming probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Destination of an envelope: a single peer, or the whole connected mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Peer(PeerId),
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeKind {
    Direct { payload: Vec<u8> },
    Broadcast { payload: Vec<u8> },
    DhtQuery { key_hash: PeerId, request_id: MessageId },
    DhtResponse { key_hash: PeerId, request_id: MessageId, value: Option<Vec<u8>>, version: u64 },
    DhtReplicate { key_hash: PeerId, value: Option<Vec<u8>>, version: u64, ttl_secs: Option<u64>, origin: PeerId },
    DhtNotify { key_hash: PeerId, value: Option<Vec<u8>>, version: u64, origin: PeerId },
    DhtSubscribe { key_hash: PeerId },
    StoreReplicate { key: String, sealed_payload: Vec<u8>, metadata: Vec<u8> },
    Goodbye { peer_id: PeerId },
    /// Chunked application payload; `final_chunk` marks reassembly completion.
    Stream { stream_id: u64, seq: u32, final_chunk: bool, bytes: Vec<u8> },
}

/// The core's unit of message transfer. See spec §3 "Envelope".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    pub from: PeerId,
    pub to: Destination,
    pub kind: EnvelopeKind,
    pub hops: u8,
    pub ttl_hops: u8,
}

impl Envelope {
    pub fn new(from: PeerId, to: Destination, kind: EnvelopeKind) -> Self {
        Self {
            message_id: MessageId::random(),
            from,
            to,
            kind,
            hops: 0,
            ttl_hops: DEFAULT_TTL_HOPS,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.hops > self.ttl_hops
    }

    pub fn forwarded(mut self) -> Self {
        self.hops = self.hops.saturating_add(1);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Bounded LRU cache of recently-seen message ids, used by the router to
/// suppress gossip loops (§4.5). Capacity defaults to 4096 per spec.
pub struct SeenSet {
    cache: LruCache<MessageId, ()>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self { cache: LruCache::new(capacity) }
    }

    /// Returns `true` if the id was already present (and should be dropped).
    pub fn contains(&mut self, id: &MessageId) -> bool {
        self.cache.get(id).is_some()
    }

    /// Records the id as seen. Idempotent.
    pub fn insert(&mut self, id: MessageId) {
        self.cache.put(id, ());
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_SET_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_bytes() {
        let from = PeerId::new_random();
        let to = PeerId::new_random();
        let env = Envelope::new(
            from,
            Destination::Peer(to),
            EnvelopeKind::Direct { payload: b"hello".to_vec() },
        );
        let bytes = env.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn envelope_expires_past_ttl() {
        let mut env = Envelope::new(
            PeerId::new_random(),
            Destination::Broadcast,
            EnvelopeKind::Broadcast { payload: vec![] },
        );
        env.ttl_hops = 1;
        assert!(!env.is_expired());
        env = env.forwarded().forwarded();
        assert!(env.is_expired());
    }

    #[test]
    fn seen_set_deduplicates_and_evicts_lru() {
        let mut seen = SeenSet::new(2);
        let a = MessageId::random();
        let b = MessageId::random();
        let c = MessageId::random();

        assert!(!seen.contains(&a));
        seen.insert(a);
        assert!(seen.contains(&a));

        seen.insert(b);
        seen.insert(c); // evicts `a`, the least recently used
        assert!(!seen.contains(&a));
        assert!(seen.contains(&b));
        assert!(seen.contains(&c));
    }
}

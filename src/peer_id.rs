// Copyright (c) 2024 Botho Foundation

//! Peer identifier space and XOR-distance metric (C1).
//!
//! A [`PeerId`] is a self-chosen 160-bit value, canonically a 40-character
//! lowercase hex string. No I/O, no state; operations fail only on malformed
//! input.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;

use crate::error::CoreError;

pub const PEER_ID_BYTES: usize = 20;

/// Unsigned 160-bit XOR distance between two [`PeerId`]s.
///
/// Stored big-endian, the same byte order as `PeerId` itself, so ordering
/// comparisons on the raw bytes agree with the numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; PEER_ID_BYTES]);

impl Distance {
    /// Number of leading zero bits, used for Kademlia-style bucket selection.
    pub fn leading_zero_bits(&self) -> u8 {
        let mut bits = 0u8;
        for byte in self.0 {
            if byte == 0 {
                bits += 8;
                continue;
            }
            bits += byte.leading_zeros() as u8;
            break;
        }
        bits
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    /// Draws a new identifier from a cryptographically strong source.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; PEER_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    /// Parses the canonical 40-character lowercase hex form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.len() != PEER_ID_BYTES * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidPeerId(s.to_string()));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(CoreError::InvalidPeerId(s.to_string()));
        }
        let decoded =
            hex::decode(s).map_err(|_| CoreError::InvalidPeerId(s.to_string()))?;
        let mut bytes = [0u8; PEER_ID_BYTES];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `key_hash` derivation for the DHT: SHA1 of a logical key, interpreted
    /// as a point in the same id space.
    pub fn from_key_hash(logical_key: &str) -> Self {
        use sha1::{Digest, Sha1};
        let digest = Sha1::digest(logical_key.as_bytes());
        let mut bytes = [0u8; PEER_ID_BYTES];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn xor(&self, other: &PeerId) -> Distance {
        let mut out = [0u8; PEER_ID_BYTES];
        for i in 0..PEER_ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    pub fn distance_to(&self, other: &PeerId) -> Distance {
        self.xor(other)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PeerId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_well_formed() {
        let id = PeerId::new_random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(PeerId::parse(&hex).unwrap(), id);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(PeerId::parse("too-short").is_err());
        assert!(PeerId::parse(&"a".repeat(41)).is_err());
        assert!(PeerId::parse(&"A".repeat(40)).is_err());
        assert!(PeerId::parse(&"z".repeat(40)).is_err());
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_for_self() {
        let a = PeerId::new_random();
        let b = PeerId::new_random();
        assert_eq!(a.xor(&a).0, [0u8; PEER_ID_BYTES]);
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn closer_distance_orders_smaller() {
        let a = PeerId::parse(&"00".repeat(20)).unwrap();
        let b = PeerId::parse(&("01".to_string().repeat(1) + &"00".repeat(19))).unwrap();
        let c = PeerId::parse(&"ff".repeat(20)).unwrap();
        assert!(a.xor(&b) < a.xor(&c));
    }

    #[test]
    fn leading_zero_bits_counts_from_msb() {
        let zero = Distance([0u8; PEER_ID_BYTES]);
        assert_eq!(zero.leading_zero_bits(), 160);

        let mut one_bit = [0u8; PEER_ID_BYTES];
        one_bit[0] = 0b0100_0000;
        assert_eq!(Distance(one_bit).leading_zero_bits(), 1);
    }

    #[test]
    fn key_hash_is_deterministic() {
        let a = PeerId::from_key_hash("alpha");
        let b = PeerId::from_key_hash("alpha");
        assert_eq!(a, b);
        assert_ne!(a, PeerId::from_key_hash("beta"));
    }
}

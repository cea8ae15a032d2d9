//! Node, connection, and message identifiers.
//!
//! Node ids are 26-character Crockford base32 strings: a millisecond
//! timestamp prefix followed by bits from a sha2 digest of local entropy,
//! so ids sort roughly by creation time and never collide in practice.
//! Message ids are `"{origin}:{counter}"` with a per-node counter seeded
//! from the wall clock in microseconds — restarts keep producing strictly
//! increasing counters, which downstream dedup relies on.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of a node process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a fresh node id: wall-clock millis plus a digest over
    /// nanosecond time and thread-local entropy.
    pub fn generate() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(now.as_nanos().to_be_bytes());
        hasher.update(rand::thread_rng().r#gen::<[u8; 16]>());
        let digest = hasher.finalize();
        NodeId(encode_id(now.as_millis() as u64, &digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// A ring key. Opaque string; the total order is plain byte order and the
/// circular order on top of it lives in [`crate::keyspace`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(pub String);

impl Key {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s)
    }
}

/// Process-local id of a peer connection. Unique and immutable for the
/// lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalConnId(pub u32);

impl fmt::Display for LocalConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc{}", self.0)
    }
}

/// Process-local id of a raw transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawConnId(pub u64);

impl fmt::Display for RawConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raw{}", self.0)
    }
}

/// Message id: `"{origin}:{counter}"`, monotonic per sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(pub String);

impl MsgId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The counter portion, if the id is well formed.
    pub fn counter(&self) -> Option<u64> {
        self.0.rsplit_once(':').and_then(|(_, c)| c.parse().ok())
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id generator shared by a node: message ids, peer-connection ids, raw ids.
#[derive(Debug)]
pub struct IdGen {
    origin: NodeId,
    msg_counter: AtomicU64,
    conn_counter: AtomicU32,
    raw_counter: AtomicU64,
}

impl IdGen {
    pub fn new(origin: NodeId) -> Self {
        // Seed the message counter from wall-clock micros so ids stay
        // monotonic across restarts of the same node id.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        IdGen {
            origin,
            msg_counter: AtomicU64::new(seed),
            conn_counter: AtomicU32::new(1),
            raw_counter: AtomicU64::new(1),
        }
    }

    pub fn next_msg_id(&self) -> MsgId {
        let counter = self.msg_counter.fetch_add(1, Ordering::Relaxed);
        MsgId(format!("{}:{}", self.origin, counter))
    }

    pub fn next_conn_id(&self) -> LocalConnId {
        LocalConnId(self.conn_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_raw_id(&self) -> RawConnId {
        RawConnId(self.raw_counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Pack 48 bits of millisecond timestamp and 80 digest bits into one
/// big-endian accumulator and peel off five bits per character, most
/// significant first. The timestamp prefix keeps ids time-ordered.
fn encode_id(millis: u64, digest: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
    let mut acc: u128 = ((millis as u128) & 0xFFFF_FFFF_FFFF) << 80;
    for (i, byte) in digest.iter().take(10).enumerate() {
        acc |= (*byte as u128) << (72 - 8 * i);
    }
    // 26 characters cover 130 bit slots; the top slot carries only the
    // highest 3 timestamp bits, as in any base32 rendering of 128 bits.
    (0..26)
        .rev()
        .map(|slot| ALPHABET[(acc >> (slot * 5) & 0x1F) as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_length_and_uniqueness() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.0.len(), 26);
        assert_ne!(a, b);
    }

    #[test]
    fn node_ids_stay_in_the_crockford_alphabet() {
        let id = NodeId::generate();
        assert!(
            id.as_str()
                .chars()
                .all(|c| "0123456789ABCDEFGHJKMNPQRSTVWXYZ".contains(c)),
            "unexpected character in {id}"
        );
    }

    #[test]
    fn node_ids_sort_by_creation_time() {
        let a = NodeId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = NodeId::generate();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn msg_ids_are_monotonic_per_sender() {
        let ids = IdGen::new(NodeId::from("n1"));
        let a = ids.next_msg_id();
        let b = ids.next_msg_id();
        assert!(a.counter().unwrap() < b.counter().unwrap());
        assert!(a.as_str().starts_with("n1:"));
    }

    #[test]
    fn conn_ids_never_repeat() {
        let ids = IdGen::new(NodeId::generate());
        let a = ids.next_conn_id();
        let b = ids.next_conn_id();
        assert_ne!(a, b);
    }
}

use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Bit width of the ring. Every address and filename is mapped into
/// `[0, 2^RING_BITS)`, and finger tables carry one entry per bit.
pub const RING_BITS: u32 = 32;

/// A position on the identifier ring.
///
/// Positions are produced by hashing an address or filename with SHA-1 and
/// reducing the digest modulo `2^RING_BITS`. All interval tests are
/// wraparound-aware; plain `<` comparisons are never enough on a circle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RingId(u64);

impl RingId {
    /// Map an opaque key (node address or filename) onto the ring.
    pub fn hash_of(key: &str) -> RingId {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();

        let wide = BigUint::from_bytes_be(&digest) % (BigUint::from(1u8) << RING_BITS);
        // Result is below 2^32, so the digit fits a single u64.
        RingId(wide.iter_u64_digits().next().unwrap_or(0))
    }

    /// Wrap a raw value into the ring, reducing modulo `2^RING_BITS`.
    pub const fn from_raw(value: u64) -> RingId {
        RingId(value % (1 << RING_BITS))
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The finger target for slot `index`: `(self + 2^index) mod 2^RING_BITS`.
    pub fn finger_target(&self, index: u32) -> RingId {
        RingId::from_raw(self.0.wrapping_add(1 << index))
    }

    /// Tests if self lies on the clockwise arc `(lower, upper]`.
    ///
    /// When `lower == upper` the arc covers the entire ring; a singleton node
    /// is the successor of every key.
    pub fn is_between(&self, lower: &RingId, upper: &RingId) -> bool {
        match lower.cmp(upper) {
            Ordering::Less => self.0 > lower.0 && self.0 <= upper.0,
            Ordering::Equal => true,
            Ordering::Greater => self.0 > lower.0 || self.0 <= upper.0,
        }
    }

    /// Tests if self lies strictly inside the clockwise arc `(lower, upper)`.
    pub fn is_within(&self, lower: &RingId, upper: &RingId) -> bool {
        match lower.cmp(upper) {
            Ordering::Less => self.0 > lower.0 && self.0 < upper.0,
            Ordering::Equal => self.0 != lower.0,
            Ordering::Greater => self.0 > lower.0 || self.0 < upper.0,
        }
    }
}

impl fmt::Debug for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingId({})", self.0)
    }
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One routing shortcut: the ring position this slot aims at and the address
/// of the node currently believed to own it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerEntry {
    pub target: RingId,
    pub addr: String,
}

/// SHA-256 of arbitrary bytes as lowercase hex. Used for block hashes,
/// record fingerprints, and transfer checksums.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_in_range() {
        let a = RingId::hash_of("10.0.0.1:7000");
        let b = RingId::hash_of("10.0.0.1:7000");
        assert_eq!(a, b);
        assert!(a.as_u64() < 1 << RING_BITS);
        assert_ne!(a, RingId::hash_of("10.0.0.1:7001"));
    }

    #[test]
    fn betweenness_wraps_on_a_sixteen_position_ring() {
        // Arc (14, 2] passes through zero: 15 is on it, 5 is not.
        let a = RingId::from_raw(2);
        let b = RingId::from_raw(14);
        assert!(RingId::from_raw(15).is_between(&b, &a));
        assert!(!RingId::from_raw(5).is_between(&b, &a));

        // The non-wrapping arc (2, 14] holds 5 but not 15.
        assert!(RingId::from_raw(5).is_between(&a, &b));
        assert!(!RingId::from_raw(15).is_between(&a, &b));
    }

    #[test]
    fn betweenness_bounds() {
        let a = RingId::from_raw(2);
        let b = RingId::from_raw(14);
        // Upper bound inclusive, lower exclusive.
        assert!(b.is_between(&a, &b));
        assert!(!a.is_between(&a, &b));
        // Strict variant excludes both ends.
        assert!(!b.is_within(&a, &b));
        assert!(!a.is_within(&a, &b));
        assert!(RingId::from_raw(13).is_within(&a, &b));
    }

    #[test]
    fn degenerate_arc_covers_the_ring() {
        let a = RingId::from_raw(7);
        assert!(RingId::from_raw(3).is_between(&a, &a));
        assert!(a.is_between(&a, &a));
        assert!(RingId::from_raw(3).is_within(&a, &a));
        assert!(!a.is_within(&a, &a));
    }

    #[test]
    fn finger_targets_wrap() {
        let id = RingId::from_raw((1 << RING_BITS) - 1);
        assert_eq!(id.finger_target(0), RingId::from_raw(0));
        assert_eq!(id.finger_target(3), RingId::from_raw(7));
        let origin = RingId::from_raw(0);
        assert_eq!(origin.finger_target(31), RingId::from_raw(1 << 31));
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

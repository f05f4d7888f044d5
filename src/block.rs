use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::keyspace::sha256_hex;
use crate::record::MaintenanceRecord;

/// A hash-linked, content-addressed unit of the ledger.
///
/// `hash` commits to every other field through a canonical serialization:
/// the fields are rendered as a JSON object with sorted keys and hashed with
/// SHA-256. `hash` itself is excluded from the preimage so it can be filled
/// in after mining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: f64,
    pub nonce: u64,
    pub records: Vec<MaintenanceRecord>,
    pub hash: String,
}

impl Block {
    /// A fresh candidate block; the hash is empty until proof of work runs.
    pub fn new(
        index: u64,
        previous_hash: impl Into<String>,
        timestamp: f64,
        records: Vec<MaintenanceRecord>,
    ) -> Block {
        Block {
            index,
            previous_hash: previous_hash.into(),
            timestamp,
            nonce: 0,
            records,
            hash: String::new(),
        }
    }

    /// The fixed first block of every chain. Deterministic, so nodes that
    /// bootstrap independently still agree on block zero.
    pub fn genesis() -> Block {
        let mut block = Block::new(0, "0", 0.0, Vec::new());
        block.hash = block.compute_hash();
        block
    }

    /// Recompute the canonical hash from the block's own fields,
    /// excluding the stored `hash`.
    pub fn compute_hash(&self) -> String {
        // serde_json objects keep their keys sorted, which makes this
        // rendering canonical.
        let preimage = json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "timestamp": self.timestamp,
            "nonce": self.nonce,
            "records": self.records,
        });
        sha256_hex(preimage.to_string().as_bytes())
    }

    /// Does the stored hash carry the required number of leading zero hex
    /// characters?
    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        self.hash.bytes().take(difficulty).filter(|b| *b == b'0').count() == difficulty
    }

    /// Seconds since the Unix epoch, as mined-block timestamps are recorded.
    pub fn now_timestamp() -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a, b);
        assert_eq!(a.previous_hash, "0");
        assert!(a.records.is_empty());
        assert_eq!(a.hash, a.compute_hash());
    }

    #[test]
    fn hash_excludes_the_stored_hash() {
        let mut block = Block::new(1, "abc", 12.5, Vec::new());
        let before = block.compute_hash();
        block.hash = "0000tampered".to_string();
        assert_eq!(block.compute_hash(), before);
    }

    #[test]
    fn hash_commits_to_records() {
        let record = MaintenanceRecord::new("G-ABCD", "2020-01-01", "check.pdf", "aa");
        let plain = Block::new(1, "abc", 12.5, Vec::new());
        let with_record = Block::new(1, "abc", 12.5, vec![record]);
        assert_ne!(plain.compute_hash(), with_record.compute_hash());
    }

    #[test]
    fn nonce_changes_the_hash() {
        let mut block = Block::new(1, "abc", 12.5, Vec::new());
        let before = block.compute_hash();
        block.nonce += 1;
        assert_ne!(block.compute_hash(), before);
    }

    #[test]
    fn difficulty_counts_leading_zeros() {
        let mut block = Block::new(1, "abc", 12.5, Vec::new());
        block.hash = "000a11".to_string();
        assert!(block.meets_difficulty(3));
        assert!(!block.meets_difficulty(4));
        block.hash = "00".to_string();
        assert!(!block.meets_difficulty(3));
    }

    #[test]
    fn serialization_round_trips_the_hash() {
        let mut block = Block::new(3, "def", Block::now_timestamp(), Vec::new());
        block.hash = block.compute_hash();
        let encoded = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.compute_hash(), decoded.hash);
    }
}

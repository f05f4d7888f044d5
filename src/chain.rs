use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::block::Block;
use crate::error::ChainError;
use crate::pool::{RecordPool, BATCH_LIMIT};

/// Leading zero hex characters a block hash must carry.
pub const DEFAULT_DIFFICULTY: usize = 4;

/// Result of a mining attempt. An empty pool is a normal outcome, not an
/// error.
#[derive(Debug, Clone, PartialEq)]
pub enum MineOutcome {
    Mined(Block),
    PoolEmpty,
}

/// The append-only, proof-of-work secured ledger held by a single node.
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    difficulty: usize,
}

impl Blockchain {
    /// A fresh chain holding only the genesis block.
    pub fn new(difficulty: usize) -> Blockchain {
        Blockchain {
            blocks: vec![Block::genesis()],
            difficulty,
        }
    }

    /// Rebuild a chain from stored blocks, refusing anything that does not
    /// validate end to end.
    pub fn from_blocks(blocks: Vec<Block>, difficulty: usize) -> Result<Blockchain, ChainError> {
        let chain = Blockchain { blocks, difficulty };
        if chain.blocks.is_empty() || !chain.is_valid() {
            return Err(ChainError::InvalidChain);
        }
        Ok(chain)
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn last(&self) -> &Block {
        self.blocks.last().expect("chain always holds genesis")
    }

    /// A candidate block extending the current tip with the given records.
    /// The hash is left unset until proof of work solves it.
    pub fn candidate(&self, records: Vec<crate::record::MaintenanceRecord>) -> Block {
        let tip = self.last();
        Block::new(
            tip.index + 1,
            tip.hash.clone(),
            Block::now_timestamp(),
            records,
        )
    }

    /// Verify and append a solved block. Rejection leaves the chain as it
    /// was; the caller must not mutate the pool on rejection.
    pub fn add_block(&mut self, block: Block) -> Result<(), ChainError> {
        let tip = self.last();
        if block.previous_hash != tip.hash {
            return Err(ChainError::PreviousHashMismatch {
                stated: block.previous_hash.clone(),
                tip: tip.hash.clone(),
            });
        }
        self.check_block_hash(&block)?;
        info!(index = block.index, hash = %block.hash, "block accepted");
        self.blocks.push(block);
        Ok(())
    }

    /// Is the stored hash internally consistent with the block's contents
    /// and does it meet the proof-of-work threshold?
    fn check_block_hash(&self, block: &Block) -> Result<(), ChainError> {
        if !block.meets_difficulty(self.difficulty) {
            return Err(ChainError::DifficultyNotMet);
        }
        if block.compute_hash() != block.hash {
            return Err(ChainError::HashMismatch);
        }
        Ok(())
    }

    /// Walk the chain from genesis. A single inconsistency anywhere
    /// invalidates the whole chain.
    pub fn is_valid(&self) -> bool {
        let mut previous_hash = String::new();
        for (position, block) in self.blocks.iter().enumerate() {
            // Only the block in the genesis position is exempt from the
            // linkage and proof-of-work checks; a stored index of 0 proves
            // nothing.
            if position != 0 {
                if block.previous_hash != previous_hash {
                    return false;
                }
                if self.check_block_hash(block).is_err() {
                    return false;
                }
            }
            previous_hash = block.compute_hash();
        }
        true
    }

    /// Longest-valid-chain adoption. The candidate must be strictly longer
    /// than the local chain and must itself validate end to end before it
    /// replaces anything. Returns true if the chain was replaced.
    pub fn adopt_if_longer(&mut self, candidate: Vec<Block>) -> Result<bool, ChainError> {
        if candidate.len() <= self.blocks.len() {
            return Ok(false);
        }
        if !self.is_valid() {
            // Sanity precondition: never swap on top of local corruption.
            warn!("local chain no longer validates, refusing replacement");
            return Err(ChainError::InvalidChain);
        }
        let replacement = Blockchain::from_blocks(candidate, self.difficulty)?;
        info!(
            old_len = self.blocks.len(),
            new_len = replacement.blocks.len(),
            "adopting longer peer chain"
        );
        self.blocks = replacement.blocks;
        Ok(true)
    }

    /// Proof that a record with the given fingerprint is included in the
    /// chain and that its containing block has not been tampered with.
    pub fn is_record_valid(&self, fingerprint: &str, filename: &str) -> bool {
        let mut previous_hash = String::new();
        for block in &self.blocks {
            for record in &block.records {
                if record.filename == filename && record.fingerprint == fingerprint {
                    if block.previous_hash == previous_hash
                        && self.check_block_hash(block).is_ok()
                    {
                        return true;
                    }
                }
            }
            previous_hash = block.compute_hash();
        }
        false
    }

    /// Find the chain record for a filename, newest block first.
    pub fn record_for(&self, filename: &str) -> Option<&crate::record::MaintenanceRecord> {
        self.blocks
            .iter()
            .rev()
            .flat_map(|b| b.records.iter())
            .find(|r| r.filename == filename)
    }

    /// Take a batch from the pool, solve proof of work, and append the
    /// result. This is the synchronous form; nodes run the search on a
    /// blocking task with their shutdown flag instead.
    pub fn mine(&mut self, pool: &mut RecordPool) -> Result<MineOutcome, ChainError> {
        let batch = pool.peek_batch(BATCH_LIMIT);
        if batch.is_empty() {
            debug!("record pool empty, nothing to mine");
            return Ok(MineOutcome::PoolEmpty);
        }

        let candidate = self.candidate(batch.clone());
        let never = Arc::new(AtomicBool::new(false));
        let solved = proof_of_work(candidate, self.difficulty, never)
            .ok_or(ChainError::MiningCancelled)?;

        self.add_block(solved.clone())?;
        pool.remove_verified(&batch);
        Ok(MineOutcome::Mined(solved))
    }
}

/// Increment the nonce until the block hash gains the required zero prefix.
///
/// CPU-bound and unbounded; termination is probabilistic. The cancel flag is
/// polled every iteration so a shutdown or a lost consensus race can abandon
/// the search, in which case None is returned.
pub fn proof_of_work(mut block: Block, difficulty: usize, cancel: Arc<AtomicBool>) -> Option<Block> {
    info!(index = block.index, difficulty, "starting proof of work");
    block.nonce = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            info!(index = block.index, "proof of work cancelled");
            return None;
        }
        let hash = block.compute_hash();
        if hash.bytes().take(difficulty).filter(|b| *b == b'0').count() == difficulty {
            info!(index = block.index, nonce = block.nonce, %hash, "block solved");
            block.hash = hash;
            return Some(block);
        }
        block.nonce += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MaintenanceRecord;

    const TEST_DIFFICULTY: usize = 2;

    fn record(n: usize) -> MaintenanceRecord {
        MaintenanceRecord::from_bytes("G-AAAA", "2020-01-01", format!("{n}.pdf"), b"doc")
    }

    fn mined_chain(blocks: usize, records_per_block: usize) -> Blockchain {
        let mut chain = Blockchain::new(TEST_DIFFICULTY);
        let mut pool = RecordPool::new();
        let mut n = 0;
        for _ in 0..blocks {
            for _ in 0..records_per_block {
                pool.add(record(n));
                n += 1;
            }
            match chain.mine(&mut pool).unwrap() {
                MineOutcome::Mined(_) => {}
                MineOutcome::PoolEmpty => panic!("pool should not be empty"),
            }
        }
        chain
    }

    #[test]
    fn empty_pool_is_a_noop() {
        let mut chain = Blockchain::new(TEST_DIFFICULTY);
        let mut pool = RecordPool::new();
        assert_eq!(chain.mine(&mut pool).unwrap(), MineOutcome::PoolEmpty);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn mining_caps_batches_and_leaves_the_remainder_pooled() {
        let mut chain = Blockchain::new(TEST_DIFFICULTY);
        let mut pool = RecordPool::new();
        for n in 0..7 {
            pool.add(record(n));
        }

        chain.mine(&mut pool).unwrap();
        chain.mine(&mut pool).unwrap();

        // Two blocks of three on top of genesis, one record still pending.
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.blocks()[1].records.len(), 3);
        assert_eq!(chain.blocks()[2].records.len(), 3);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.records()[0].filename, "6.pdf");
    }

    #[test]
    fn accepted_blocks_satisfy_the_proof_of_work_invariant() {
        let chain = mined_chain(2, 1);
        for block in &chain.blocks()[1..] {
            assert!(block.hash.starts_with(&"0".repeat(TEST_DIFFICULTY)));
            assert_eq!(block.compute_hash(), block.hash);
        }
    }

    #[test]
    fn validation_is_idempotent() {
        let chain = mined_chain(2, 2);
        assert_eq!(chain.is_valid(), chain.is_valid());
        assert!(chain.is_valid());
    }

    #[test]
    fn tampering_is_detected_and_reversible() {
        let mut chain = mined_chain(2, 1);
        assert!(chain.is_valid());

        let original_hash = chain.blocks[1].hash.clone();
        chain.blocks[1].hash = format!("00{}", &original_hash[2..].to_uppercase());
        assert!(!chain.is_valid());
        chain.blocks[1].hash = original_hash;
        assert!(chain.is_valid());

        let original_name = chain.blocks[2].records[0].filename.clone();
        chain.blocks[2].records[0].filename = "forged.pdf".to_string();
        assert!(!chain.is_valid());
        chain.blocks[2].records[0].filename = original_name;
        assert!(chain.is_valid());
    }

    #[test]
    fn a_block_claiming_index_zero_is_still_validated() {
        let mut chain = mined_chain(2, 1);
        assert!(chain.is_valid());

        // Forging the index does not buy the genesis exemption; the block
        // no longer matches its stored hash.
        chain.blocks[2].index = 0;
        assert!(!chain.is_valid());
    }

    #[test]
    fn add_block_rejects_a_stale_previous_hash() {
        let mut chain = Blockchain::new(TEST_DIFFICULTY);
        let mut stale = chain.candidate(vec![record(0)]);
        stale.previous_hash = "not the tip".to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        let stale = proof_of_work(stale, TEST_DIFFICULTY, cancel).unwrap();

        assert!(matches!(
            chain.add_block(stale),
            Err(ChainError::PreviousHashMismatch { .. })
        ));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn add_block_rejects_unsolved_blocks() {
        let mut chain = Blockchain::new(TEST_DIFFICULTY);
        let mut unsolved = chain.candidate(vec![record(0)]);
        unsolved.hash = unsolved.compute_hash();
        assert!(matches!(
            chain.add_block(unsolved),
            Err(ChainError::DifficultyNotMet) | Err(ChainError::HashMismatch)
        ));
    }

    #[test]
    fn longer_valid_chains_are_adopted() {
        let long = mined_chain(4, 1);
        let mut local = mined_chain(1, 1);

        assert!(local.adopt_if_longer(long.blocks().to_vec()).unwrap());
        assert_eq!(local.len(), 5);
        assert_eq!(local.blocks(), long.blocks());
    }

    #[test]
    fn shorter_or_equal_chains_are_ignored() {
        let short = mined_chain(1, 1);
        let mut local = mined_chain(2, 1);
        assert!(!local.adopt_if_longer(short.blocks().to_vec()).unwrap());
        assert_eq!(local.len(), 3);
    }

    #[test]
    fn longer_but_invalid_chains_are_refused() {
        let mut forged = mined_chain(3, 1).blocks().to_vec();
        forged[2].records[0].fingerprint = "forged".to_string();
        let mut local = mined_chain(1, 1);

        assert_eq!(
            local.adopt_if_longer(forged),
            Err(ChainError::InvalidChain)
        );
        assert_eq!(local.len(), 2);
    }

    #[test]
    fn record_inclusion_checks_fingerprint_and_linkage() {
        let mut chain = Blockchain::new(TEST_DIFFICULTY);
        let mut pool = RecordPool::new();
        let rec = record(0);
        pool.add(rec.clone());
        chain.mine(&mut pool).unwrap();

        assert!(chain.is_record_valid(&rec.fingerprint, &rec.filename));
        assert!(!chain.is_record_valid("wrong", &rec.filename));
        assert!(!chain.is_record_valid(&rec.fingerprint, "other.pdf"));

        // Tamper with the containing block: inclusion proof must fail.
        chain.blocks[1].nonce += 1;
        assert!(!chain.is_record_valid(&rec.fingerprint, &rec.filename));
    }

    #[test]
    fn cancelled_mining_returns_none() {
        let chain = Blockchain::new(TEST_DIFFICULTY);
        let candidate = chain.candidate(vec![record(0)]);
        let cancel = Arc::new(AtomicBool::new(true));
        assert!(proof_of_work(candidate, TEST_DIFFICULTY, cancel).is_none());
    }
}

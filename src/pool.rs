use tracing::debug;

use crate::record::MaintenanceRecord;

/// How many records a single block may verify. Deliberately small: it bounds
/// both the proof-of-work latency per block and the block size.
pub const BATCH_LIMIT: usize = 3;

/// Staging area for attestation records awaiting inclusion in a mined block.
///
/// Admission is FIFO, with at most one in-flight unverified record per
/// filename at a time.
#[derive(Debug, Default)]
pub struct RecordPool {
    unverified: Vec<MaintenanceRecord>,
}

impl RecordPool {
    pub fn new() -> RecordPool {
        RecordPool::default()
    }

    /// Admit a record. Returns false (a no-op) if a record for the same
    /// filename is already pending.
    pub fn add(&mut self, record: MaintenanceRecord) -> bool {
        if self.unverified.iter().any(|r| r.filename == record.filename) {
            debug!(filename = %record.filename, "record already pending, not admitted");
            return false;
        }
        self.unverified.push(record);
        true
    }

    /// Up to `limit` oldest pending records, in admission order. Empty if
    /// the pool is empty.
    pub fn peek_batch(&self, limit: usize) -> Vec<MaintenanceRecord> {
        self.unverified.iter().take(limit).cloned().collect()
    }

    /// Drop every pool entry matching a verified record by registration and
    /// filename. Called only after the enclosing block is durably on the
    /// chain, never speculatively.
    pub fn remove_verified(&mut self, verified: &[MaintenanceRecord]) {
        self.unverified.retain(|pending| {
            !verified
                .iter()
                .any(|v| v.aircraft_reg == pending.aircraft_reg && v.filename == pending.filename)
        });
    }

    pub fn records(&self) -> &[MaintenanceRecord] {
        &self.unverified
    }

    pub fn len(&self) -> usize {
        self.unverified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unverified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reg: &str, filename: &str) -> MaintenanceRecord {
        MaintenanceRecord::new(reg, "2020-01-01", filename, "aa")
    }

    #[test]
    fn duplicate_filenames_are_suppressed() {
        let mut pool = RecordPool::new();
        assert!(pool.add(record("G-AAAA", "a.pdf")));
        assert!(!pool.add(record("G-BBBB", "a.pdf")));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn batch_is_capped_and_fifo() {
        let mut pool = RecordPool::new();
        for i in 0..10 {
            pool.add(record("G-AAAA", &format!("{i}.pdf")));
        }
        let batch = pool.peek_batch(BATCH_LIMIT);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].filename, "0.pdf");
        assert_eq!(batch[2].filename, "2.pdf");
    }

    #[test]
    fn small_and_empty_pools() {
        let mut pool = RecordPool::new();
        assert!(pool.peek_batch(BATCH_LIMIT).is_empty());
        pool.add(record("G-AAAA", "only.pdf"));
        assert_eq!(pool.peek_batch(BATCH_LIMIT).len(), 1);
    }

    #[test]
    fn remove_verified_matches_on_registration_and_filename() {
        let mut pool = RecordPool::new();
        pool.add(record("G-AAAA", "a.pdf"));
        pool.add(record("G-BBBB", "b.pdf"));

        // Same filename, different aircraft: not a match.
        pool.remove_verified(&[record("G-ZZZZ", "a.pdf")]);
        assert_eq!(pool.len(), 2);

        pool.remove_verified(&[record("G-AAAA", "a.pdf")]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.records()[0].filename, "b.pdf");
    }
}

use serde::{Deserialize, Serialize};

use crate::keyspace::sha256_hex;

/// An attestation that a maintenance task was performed on an aircraft,
/// backed by a document whose bytes are fingerprinted with SHA-256.
///
/// Records are immutable once the fingerprint is computed; they move from the
/// record pool into a mined block and never change shape in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub aircraft_reg: String,
    pub record_date: String,
    pub filename: String,
    pub fingerprint: String,
}

impl MaintenanceRecord {
    pub fn new(
        aircraft_reg: impl Into<String>,
        record_date: impl Into<String>,
        filename: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> MaintenanceRecord {
        MaintenanceRecord {
            aircraft_reg: aircraft_reg.into(),
            record_date: record_date.into(),
            filename: filename.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Build a record by fingerprinting the document bytes directly.
    pub fn from_bytes(
        aircraft_reg: impl Into<String>,
        record_date: impl Into<String>,
        filename: impl Into<String>,
        bytes: &[u8],
    ) -> MaintenanceRecord {
        MaintenanceRecord::new(aircraft_reg, record_date, filename, sha256_hex(bytes))
    }

    /// Boundary validation: every field must be present. Malformed
    /// submissions are rejected before they touch the pool.
    pub fn is_well_formed(&self) -> bool {
        !self.aircraft_reg.is_empty()
            && !self.record_date.is_empty()
            && !self.filename.is_empty()
            && !self.fingerprint.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_fingerprints_content() {
        let record = MaintenanceRecord::from_bytes("G-ABCD", "2020-01-01", "check.pdf", b"engine ok");
        assert_eq!(record.fingerprint, sha256_hex(b"engine ok"));
        assert!(record.is_well_formed());
    }

    #[test]
    fn missing_fields_are_malformed() {
        let record = MaintenanceRecord::new("G-ABCD", "", "check.pdf", "aa");
        assert!(!record.is_well_formed());
    }
}

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::keyspace::{FingerEntry, RingId};
use crate::record::MaintenanceRecord;

/// The logical RPC surface a node exposes to its peers. The transport layer
/// carries these verbatim as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // Liveness
    Ping,

    // Ring state and routing
    GetSuccessor,
    GetPredecessor,
    Notify { candidate: String },
    Stabilize,
    FixFingers,
    FindSuccessor { key: RingId },
    GetFingerTable,
    Leave,

    // File placement
    GetStoredFiles,
    HasFile { filename: String },
    FileChecksum { filename: String },
    StoreFile { filename: String, bytes: Vec<u8>, checksum: String },
    HandoffFiles { to: String },

    // Peer management
    Register { addr: String },
    GetPeers,
    SyncPeers,

    // Ledger
    GetChain,
    SyncChain,
    AddBlock { block: Block },
    SubmitRecord { record: MaintenanceRecord },
    SyncRecord { record: MaintenanceRecord },
    GetRecordPool,
    Mine,
    VerifyRecord { filename: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Pong,
    /// The node has departed and refuses service; callers treat this as a
    /// liveness failure.
    Offline,

    Address { addr: Option<String> },
    Addresses { addrs: Vec<String> },
    FingerTable { fingers: Vec<FingerEntry> },

    Files { filenames: Vec<String> },
    HasFile { present: bool },
    Checksum { checksum: Option<String> },

    Welcome { peers: Vec<String>, chain: Vec<Block> },
    ChainSnapshot { length: usize, chain: Vec<Block> },
    PoolSnapshot { length: usize, records: Vec<MaintenanceRecord> },
    Mined { block: Block },
    NothingToMine,
    RecordStatus { status: RecordStatus },

    Rejected { reason: String },
}

/// Verdict on a record lookup against the chain and the owning node's copy
/// of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Valid,
    Tampered,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_json() {
        let request = Request::FindSuccessor {
            key: RingId::from_raw(42),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, Request::FindSuccessor { key } if key == RingId::from_raw(42)));
    }

    #[test]
    fn responses_round_trip_as_json() {
        let response = Response::Welcome {
            peers: vec!["10.0.0.1:7000".to_string()],
            chain: vec![Block::genesis()],
        };
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Response::Welcome { peers, chain } => {
                assert_eq!(peers, vec!["10.0.0.1:7000".to_string()]);
                assert_eq!(chain, vec![Block::genesis()]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}

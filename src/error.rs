use thiserror::Error;

/// Why a block or candidate chain was not accepted. The chain and the record
/// pool are left untouched whenever one of these is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("previous hash mismatch: block states '{stated}' but the chain tip is '{tip}'")]
    PreviousHashMismatch { stated: String, tip: String },

    #[error("block hash does not match its contents")]
    HashMismatch,

    #[error("block hash does not meet the proof-of-work difficulty")]
    DifficultyNotMet,

    #[error("candidate chain failed validation")]
    InvalidChain,

    #[error("mining was cancelled before a solution was found")]
    MiningCancelled,
}

/// Outcome of a remote call. `Unreachable` is a liveness signal: the peer is
/// treated as departed and routed around. `Rejected` means the peer answered
/// and declined.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("peer '{0}' is unreachable")]
    Unreachable(String),

    #[error("peer rejected the request: {0}")]
    Rejected(String),

    #[error("peer sent an unexpected reply")]
    UnexpectedReply,
}

/// A failed attempt to place a record's file with its ring owner. The record
/// stays pooled; whether to retry is the caller's decision.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("checksum mismatch transferring '{filename}'")]
    ChecksumMismatch { filename: String },

    #[error("owner '{owner}' did not confirm holding '{filename}'")]
    OwnerUnconfirmed { owner: String, filename: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

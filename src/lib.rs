//! A peer-to-peer ledger for aircraft maintenance records.
//!
//! Nodes arrange themselves on a consistent-hashing ring and each one
//! stores the maintenance documents whose hashed filenames fall in its arc
//! of the keyspace. Alongside the ring, every node carries a full copy of a
//! proof-of-work chain of record attestations, so any participant can later
//! check that a stored document still matches the fingerprint sealed into
//! a block.
//!
//! The transport is pluggable: [`transport::TcpTransport`] runs nodes over
//! real sockets with streamed JSON framing, while [`transport::LocalNet`]
//! wires a whole cluster together inside one process for tests and
//! simulation.

pub mod block;
pub mod chain;
pub mod error;
pub mod keyspace;
pub mod message;
pub mod node;
pub mod pool;
pub mod record;
pub mod storage;
pub mod transport;

pub use block::Block;
pub use chain::{Blockchain, MineOutcome, DEFAULT_DIFFICULTY};
pub use keyspace::RingId;
pub use node::{Node, NodeConfig, NodeHandle};
pub use pool::{RecordPool, BATCH_LIMIT};
pub use record::MaintenanceRecord;

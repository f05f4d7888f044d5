use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::chain::{Blockchain, MineOutcome, DEFAULT_DIFFICULTY};
use crate::error::ChainError;
use crate::keyspace::{FingerEntry, RingId};
use crate::message::{RecordStatus, Request, Response};
use crate::pool::RecordPool;
use crate::record::MaintenanceRecord;
use crate::storage::ChainStore;
use crate::transport::{PeerTransport, RequestHandler};

mod ledger;
mod placement;
mod ring;

use placement::FileVault;
use ring::RingState;

/// Everything a node needs to know before it starts.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's own network address, also its ring identity.
    pub addr: String,
    /// The well-known discovery address. The node carrying it forms the
    /// ring; everyone else joins through it.
    pub bootstrap_addr: String,
    /// Where the chain and stored files persist. None keeps everything in
    /// memory, which is what simulated nodes in tests want.
    pub data_dir: Option<PathBuf>,
    /// Leading zero hex characters required of a block hash.
    pub difficulty: usize,
    /// How often the periodic maintenance round runs.
    pub maintenance_interval: Duration,
}

impl NodeConfig {
    pub fn new(addr: impl Into<String>, bootstrap_addr: impl Into<String>) -> NodeConfig {
        NodeConfig {
            addr: addr.into(),
            bootstrap_addr: bootstrap_addr.into(),
            data_dir: None,
            difficulty: DEFAULT_DIFFICULTY,
            maintenance_interval: Duration::from_secs(15),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> NodeConfig {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_difficulty(mut self, difficulty: usize) -> NodeConfig {
        self.difficulty = difficulty;
        self
    }

    pub fn with_maintenance_interval(mut self, period: Duration) -> NodeConfig {
        self.maintenance_interval = period;
        self
    }

    pub fn is_bootstrap(&self) -> bool {
        self.addr == self.bootstrap_addr
    }
}

/// The per-process node context: one explicitly constructed object owning
/// all of this node's mutable state. Handlers lock individual fields for the
/// shortest possible span and never across a remote call, so every write is
/// serialized without an RPC ever blocking on another node's progress.
pub(crate) struct NodeContext<T: PeerTransport> {
    pub(crate) config: NodeConfig,
    pub(crate) id: RingId,
    pub(crate) transport: T,
    pub(crate) ring: Mutex<RingState>,
    pub(crate) chain: Mutex<Blockchain>,
    pub(crate) pool: Mutex<RecordPool>,
    pub(crate) peers: Mutex<BTreeSet<String>>,
    pub(crate) vault: FileVault,
    pub(crate) store: Option<ChainStore>,
    pub(crate) online: AtomicBool,
    pub(crate) cancel_mining: Arc<AtomicBool>,
}

impl<T: PeerTransport> NodeContext<T> {
    /// Liveness check. A peer that cannot answer OK is treated as departed.
    pub(crate) async fn ping(&self, addr: &str) -> bool {
        if addr == self.config.addr {
            return self.online.load(Ordering::SeqCst);
        }
        matches!(
            self.transport.call(addr, Request::Ping).await,
            Ok(Response::Pong)
        )
    }
}

#[async_trait]
impl<T: PeerTransport> RequestHandler for NodeContext<T> {
    async fn handle(&self, request: Request) -> Response {
        if !self.online.load(Ordering::SeqCst) {
            return Response::Offline;
        }
        debug!(node = %self.config.addr, ?request, "handling request");
        match request {
            Request::Ping => Response::Pong,

            Request::GetSuccessor => Response::Address {
                addr: Some(self.successor()),
            },
            Request::GetPredecessor => Response::Address {
                addr: self.predecessor(),
            },
            Request::Notify { candidate } => {
                self.notified(candidate).await;
                Response::Ack
            }
            Request::Stabilize => {
                self.stabilize().await;
                Response::Ack
            }
            Request::FixFingers => {
                self.fix_fingers().await;
                Response::Ack
            }
            Request::FindSuccessor { key } => Response::Address {
                addr: Some(self.find_successor(key).await),
            },
            Request::GetFingerTable => Response::FingerTable {
                fingers: self.finger_table(),
            },
            Request::Leave => {
                self.leave().await;
                Response::Ack
            }

            Request::GetStoredFiles => Response::Files {
                filenames: self.vault.stored_filenames(),
            },
            Request::HasFile { filename } => Response::HasFile {
                present: self.vault.has(&filename),
            },
            Request::FileChecksum { filename } => Response::Checksum {
                checksum: self.vault.checksum(&filename),
            },
            Request::StoreFile {
                filename,
                bytes,
                checksum,
            } => self.receive_file(filename, bytes, checksum).await,
            Request::HandoffFiles { to } => {
                self.handoff_files(&to).await;
                Response::Ack
            }

            Request::Register { addr } => self.register_peer(addr).await,
            Request::GetPeers => Response::Addresses {
                addrs: self.known_peers(),
            },
            Request::SyncPeers => {
                self.sync_peers().await;
                Response::Ack
            }

            Request::GetChain => self.chain_snapshot(),
            Request::SyncChain => {
                self.reconcile_chain().await;
                Response::Ack
            }
            Request::AddBlock { block } => self.accept_block(block).await,
            Request::SubmitRecord { record } => self.submit_record(record).await,
            Request::SyncRecord { record } => self.sync_record(record),
            Request::GetRecordPool => self.pool_snapshot(),
            Request::Mine => match self.mine().await {
                Ok(MineOutcome::Mined(block)) => Response::Mined { block },
                Ok(MineOutcome::PoolEmpty) => Response::NothingToMine,
                Err(e) => Response::Rejected {
                    reason: e.to_string(),
                },
            },
            Request::VerifyRecord { filename } => Response::RecordStatus {
                status: self.verify_record(&filename).await,
            },
        }
    }
}

/// A not-yet-started node. Consumed by `start`, which returns a
/// `NodeHandle` for interacting with the running node.
pub struct Node<T: PeerTransport> {
    config: NodeConfig,
    transport: T,
}

impl<T: PeerTransport> Node<T> {
    pub fn new(config: NodeConfig, transport: T) -> Node<T> {
        Node { config, transport }
    }

    /// Bring the node up: reload any persisted chain, begin listening, run
    /// the join choreography (unless this is the bootstrap node, which
    /// forms a singleton ring), and start the periodic maintenance task.
    pub async fn start(self) -> NodeHandle<T> {
        let Node { config, transport } = self;
        let id = RingId::hash_of(&config.addr);
        let store = config.data_dir.as_ref().map(ChainStore::new);

        let mut chain = Blockchain::new(config.difficulty);
        if let Some(store) = &store {
            if let Some(blocks) = store.load().await {
                match Blockchain::from_blocks(blocks, config.difficulty) {
                    Ok(loaded) => chain = loaded,
                    Err(e) => {
                        warn!(node = %config.addr, error = %e, "stored chain rejected, starting from genesis");
                    }
                }
            }
        }

        let vault = FileVault::new(config.data_dir.clone());
        let ring = RingState::singleton(&config.addr, id);
        let ctx = Arc::new(NodeContext {
            id,
            transport,
            ring: Mutex::new(ring),
            chain: Mutex::new(chain),
            pool: Mutex::new(RecordPool::new()),
            peers: Mutex::new(BTreeSet::new()),
            vault,
            store,
            online: AtomicBool::new(true),
            cancel_mining: Arc::new(AtomicBool::new(false)),
            config,
        });

        info!(node = %ctx.config.addr, id = %ctx.id, "starting node");
        let handler: Arc<dyn RequestHandler> = ctx.clone();
        let listener = ctx.transport.listen(ctx.config.addr.clone(), handler);

        if ctx.config.is_bootstrap() {
            info!(node = %ctx.config.addr, "forming a new ring as the discovery node");
        } else {
            ctx.join().await;
        }

        let maintenance = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut ticker = interval(ctx.config.maintenance_interval);
                // The first tick fires immediately; skip it so freshly
                // joined state settles before the first round.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !ctx.online.load(Ordering::SeqCst) {
                        break;
                    }
                    ctx.stabilize().await;
                    ctx.fix_fingers().await;
                    ctx.check_predecessor().await;
                    ctx.sync_peers().await;
                    ctx.reconcile_chain().await;
                    ctx.persist_chain().await;
                }
            })
        };

        NodeHandle {
            ctx,
            listener,
            maintenance,
        }
    }
}

/// A connection to a running node. Dropping the handle does not stop the
/// node; call `stop` for that.
pub struct NodeHandle<T: PeerTransport> {
    ctx: Arc<NodeContext<T>>,
    listener: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl<T: PeerTransport> NodeHandle<T> {
    pub fn addr(&self) -> &str {
        &self.ctx.config.addr
    }

    pub fn ring_id(&self) -> RingId {
        self.ctx.id
    }

    pub fn successor(&self) -> String {
        self.ctx.successor()
    }

    pub fn predecessor(&self) -> Option<String> {
        self.ctx.predecessor()
    }

    pub fn finger_table(&self) -> Vec<FingerEntry> {
        self.ctx.finger_table()
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.ctx.known_peers()
    }

    pub fn chain_blocks(&self) -> Vec<crate::block::Block> {
        self.ctx
            .chain
            .lock()
            .expect("chain lock poisoned")
            .blocks()
            .to_vec()
    }

    pub fn chain_len(&self) -> usize {
        self.ctx.chain.lock().expect("chain lock poisoned").len()
    }

    pub fn pool_len(&self) -> usize {
        self.ctx.pool.lock().expect("pool lock poisoned").len()
    }

    pub fn stored_files(&self) -> Vec<String> {
        self.ctx.vault.stored_filenames()
    }

    /// Put document bytes in the staging area, ready for placement when the
    /// matching record is submitted.
    pub fn stage_file(&self, filename: impl Into<String>, bytes: Vec<u8>) {
        self.ctx.vault.stage(filename.into(), bytes);
    }

    pub async fn submit_record(&self, record: MaintenanceRecord) -> Response {
        self.ctx.submit_record(record).await
    }

    pub async fn mine(&self) -> Result<MineOutcome, ChainError> {
        self.ctx.mine().await
    }

    pub async fn verify_record(&self, filename: &str) -> RecordStatus {
        self.ctx.verify_record(filename).await
    }

    pub async fn stabilize(&self) {
        self.ctx.stabilize().await;
    }

    pub async fn fix_fingers(&self) {
        self.ctx.fix_fingers().await;
    }

    pub async fn check_predecessor(&self) {
        self.ctx.check_predecessor().await;
    }

    pub async fn reconcile_chain(&self) {
        self.ctx.reconcile_chain().await;
    }

    pub async fn sync_peers(&self) {
        self.ctx.sync_peers().await;
    }

    /// Graceful departure: relocate stored files to the successor, close the
    /// ring, and refuse service from then on.
    pub async fn leave(&self) {
        self.ctx.leave().await;
    }

    /// Force the node down without the leave choreography.
    pub async fn stop(self) {
        self.ctx.online.store(false, Ordering::SeqCst);
        self.ctx.cancel_mining.store(true, Ordering::SeqCst);
        self.listener.abort();
        let _ = self.listener.await;
        self.maintenance.abort();
        let _ = self.maintenance.await;
    }
}

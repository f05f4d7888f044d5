//! Ledger operations: record submission and gossip, mining orchestration,
//! chain reconciliation with peers, and record verification against both
//! the chain and the stored document bytes.

use tracing::{debug, info, warn};

use crate::block::Block;
use crate::chain::MineOutcome;
use crate::error::{ChainError, RpcError};
use crate::keyspace::RingId;
use crate::message::{RecordStatus, Request, Response};
use crate::pool::BATCH_LIMIT;
use crate::record::MaintenanceRecord;
use crate::transport::PeerTransport;

use super::NodeContext;

impl<T: PeerTransport> NodeContext<T> {
    pub(crate) fn chain_snapshot(&self) -> Response {
        let chain = self.chain.lock().expect("chain lock poisoned");
        Response::ChainSnapshot {
            length: chain.len(),
            chain: chain.blocks().to_vec(),
        }
    }

    pub(crate) fn pool_snapshot(&self) -> Response {
        let pool = self.pool.lock().expect("pool lock poisoned");
        Response::PoolSnapshot {
            length: pool.len(),
            records: pool.records().to_vec(),
        }
    }

    /// A newcomer announced itself. Hand back everything it needs to catch
    /// up: the full membership list and our freshest view of the chain.
    pub(crate) async fn register_peer(&self, addr: String) -> Response {
        if addr == self.config.addr {
            return Response::Rejected {
                reason: "a node cannot register with itself".to_string(),
            };
        }
        let already_known = self
            .peers
            .lock()
            .expect("peer lock poisoned")
            .contains(&addr);
        if already_known {
            return Response::Rejected {
                reason: "address already registered".to_string(),
            };
        }
        info!(node = %self.config.addr, peer = %addr, "registering new peer");
        // Serve the newcomer the longest chain the ring knows about, not
        // just our local copy.
        self.reconcile_chain().await;
        let mut peers = self.known_peers();
        peers.push(self.config.addr.clone());
        self.add_peer(&addr);
        let chain = self
            .chain
            .lock()
            .expect("chain lock poisoned")
            .blocks()
            .to_vec();
        Response::Welcome { peers, chain }
    }

    /// Pull peer lists from everyone we know and merge them.
    pub(crate) async fn sync_peers(&self) {
        for peer in self.known_peers() {
            match self.transport.call(&peer, Request::GetPeers).await {
                Ok(Response::Addresses { addrs }) => {
                    for addr in addrs {
                        self.add_peer(&addr);
                    }
                }
                Err(RpcError::Unreachable(_)) => self.drop_peer(&peer),
                _ => {}
            }
        }
    }

    /// Send a request to every known peer, forgetting peers that cannot be
    /// reached. Replies are ignored; this is gossip, not consensus.
    pub(crate) async fn broadcast(&self, request: Request) {
        for peer in self.known_peers() {
            match self.transport.call(&peer, request.clone()).await {
                Err(RpcError::Unreachable(reason)) => {
                    debug!(node = %self.config.addr, %peer, %reason, "dropping unreachable peer");
                    self.drop_peer(&peer);
                }
                _ => {}
            }
        }
    }

    /// Client-facing submission: pool the record, gossip it to peers, and
    /// place the staged document bytes with their ring owner.
    pub(crate) async fn submit_record(&self, record: MaintenanceRecord) -> Response {
        if !record.is_well_formed() {
            return Response::Rejected {
                reason: "invalid data provided to create maintenance record".to_string(),
            };
        }
        let admitted = self
            .pool
            .lock()
            .expect("pool lock poisoned")
            .add(record.clone());
        if !admitted {
            return Response::Rejected {
                reason: "a record for this filename is already pending".to_string(),
            };
        }
        info!(
            node = %self.config.addr,
            aircraft = %record.aircraft_reg,
            filename = %record.filename,
            "record pooled"
        );
        self.broadcast(Request::SyncRecord {
            record: record.clone(),
        })
        .await;
        match self.place_record(&record).await {
            Ok(()) => Response::Ack,
            Err(e) => {
                warn!(node = %self.config.addr, filename = %record.filename, error = %e, "file placement failed");
                Response::Rejected {
                    reason: format!("record pooled but file placement failed: {e}"),
                }
            }
        }
    }

    /// Gossip arrival of a record pooled elsewhere. Duplicates are dropped
    /// silently; the pool already holds that filename.
    pub(crate) fn sync_record(&self, record: MaintenanceRecord) -> Response {
        if !record.is_well_formed() {
            return Response::Rejected {
                reason: "invalid data provided to create maintenance record".to_string(),
            };
        }
        self.pool.lock().expect("pool lock poisoned").add(record);
        Response::Ack
    }

    /// A freshly mined block arriving from a peer. It either extends our
    /// tip or it does not; there is no partial acceptance.
    pub(crate) async fn accept_block(&self, block: Block) -> Response {
        let verdict = self
            .chain
            .lock()
            .expect("chain lock poisoned")
            .add_block(block.clone());
        match verdict {
            Ok(()) => {
                info!(node = %self.config.addr, index = block.index, "accepted block from peer");
                self.persist_chain().await;
                self.pool
                    .lock()
                    .expect("pool lock poisoned")
                    .remove_verified(&block.records);
                Response::Ack
            }
            Err(e) => {
                debug!(node = %self.config.addr, index = block.index, error = %e, "rejected block");
                Response::Rejected {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Mine one block from the pool. The search runs on a blocking thread
    /// with no locks held, so the node keeps answering requests at full
    /// speed while it grinds. After sealing, reconcile with the ring and
    /// only broadcast the block if it is still part of the longest chain.
    pub(crate) async fn mine(&self) -> Result<MineOutcome, ChainError> {
        self.scrub_pool_against_chain();
        let (candidate, batch) = {
            let chain = self.chain.lock().expect("chain lock poisoned");
            let pool = self.pool.lock().expect("pool lock poisoned");
            let batch = pool.peek_batch(BATCH_LIMIT);
            if batch.is_empty() {
                return Ok(MineOutcome::PoolEmpty);
            }
            (chain.candidate(batch.clone()), batch)
        };
        info!(
            node = %self.config.addr,
            index = candidate.index,
            records = batch.len(),
            "mining"
        );
        let difficulty = self.config.difficulty;
        let cancel = self.cancel_mining.clone();
        let solved = tokio::task::spawn_blocking(move || {
            crate::chain::proof_of_work(candidate, difficulty, cancel)
        })
        .await
        .map_err(|_| ChainError::MiningCancelled)?
        .ok_or(ChainError::MiningCancelled)?;

        // Losing the race to a peer's block surfaces here as a mismatch and
        // the records stay pooled for the next attempt.
        self.chain
            .lock()
            .expect("chain lock poisoned")
            .add_block(solved.clone())?;
        info!(node = %self.config.addr, index = solved.index, hash = %solved.hash, "block sealed");
        self.persist_chain().await;
        self.pool
            .lock()
            .expect("pool lock poisoned")
            .remove_verified(&batch);

        let sealed_len = self.chain.lock().expect("chain lock poisoned").len();
        self.reconcile_chain().await;
        let still_longest = self.chain.lock().expect("chain lock poisoned").len() == sealed_len;
        if still_longest {
            self.broadcast(Request::AddBlock {
                block: solved.clone(),
            })
            .await;
        } else {
            info!(node = %self.config.addr, index = solved.index, "mined block superseded by a longer chain");
        }
        Ok(MineOutcome::Mined(solved))
    }

    /// Drop every pooled record the chain already seals. Required after any
    /// chain adoption: blocks mined elsewhere verify records this node still
    /// holds as pending, and leaving them pooled would seal them twice.
    pub(crate) fn scrub_pool_against_chain(&self) {
        let sealed: Vec<MaintenanceRecord> = {
            let chain = self.chain.lock().expect("chain lock poisoned");
            chain
                .blocks()
                .iter()
                .flat_map(|block| block.records.clone())
                .collect()
        };
        if sealed.is_empty() {
            return;
        }
        self.pool
            .lock()
            .expect("pool lock poisoned")
            .remove_verified(&sealed);
    }

    /// Ask every peer for its chain and adopt any strictly longer one that
    /// validates in full.
    pub(crate) async fn reconcile_chain(&self) {
        for peer in self.known_peers() {
            match self.transport.call(&peer, Request::GetChain).await {
                Ok(Response::ChainSnapshot { length, chain }) => {
                    let adopted = {
                        let mut local = self.chain.lock().expect("chain lock poisoned");
                        if length > local.len() {
                            local.adopt_if_longer(chain)
                        } else {
                            Ok(false)
                        }
                    };
                    match adopted {
                        Ok(true) => {
                            info!(node = %self.config.addr, %peer, length, "adopted longer chain");
                            self.scrub_pool_against_chain();
                            self.persist_chain().await;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(node = %self.config.addr, %peer, error = %e, "peer offered an invalid chain");
                        }
                    }
                }
                Err(RpcError::Unreachable(_)) => self.drop_peer(&peer),
                _ => {}
            }
        }
    }

    /// Write the chain through to disk, when this node has a data dir.
    pub(crate) async fn persist_chain(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let blocks = self
            .chain
            .lock()
            .expect("chain lock poisoned")
            .blocks()
            .to_vec();
        if let Err(e) = store.save(&blocks).await {
            warn!(node = %self.config.addr, error = %e, "failed to persist chain");
        }
    }

    /// Verify a record end to end: it must appear in a valid stretch of the
    /// chain, and the document bytes stored at the file's ring owner must
    /// still match the fingerprint sealed into the block.
    pub(crate) async fn verify_record(&self, filename: &str) -> RecordStatus {
        let recorded = {
            let chain = self.chain.lock().expect("chain lock poisoned");
            chain.record_for(filename).cloned()
        };
        let Some(record) = recorded else {
            return RecordStatus::NotFound;
        };
        let chain_ok = self
            .chain
            .lock()
            .expect("chain lock poisoned")
            .is_record_valid(&record.fingerprint, filename);
        if !chain_ok {
            return RecordStatus::Tampered;
        }
        let owner = self.find_successor(RingId::hash_of(filename)).await;
        let stored = if owner == self.config.addr {
            self.vault.checksum(filename)
        } else {
            match self
                .transport
                .call(
                    &owner,
                    Request::FileChecksum {
                        filename: filename.to_string(),
                    },
                )
                .await
            {
                Ok(Response::Checksum { checksum }) => checksum,
                _ => None,
            }
        };
        match stored {
            Some(checksum) if checksum == record.fingerprint => RecordStatus::Valid,
            Some(_) => RecordStatus::Tampered,
            None => {
                // No stored copy to compare against; the chain linkage is
                // the only evidence available and it checked out.
                debug!(node = %self.config.addr, %filename, %owner, "owner holds no copy, verified against chain only");
                RecordStatus::Valid
            }
        }
    }
}

//! Ring membership and routing: the successor/predecessor pointers, the
//! finger table, and the periodic repair rounds that keep them truthful as
//! nodes come and go.

use tracing::{debug, info, warn};

use crate::keyspace::{FingerEntry, RingId, RING_BITS};
use crate::message::{Request, Response};
use crate::transport::PeerTransport;

use super::NodeContext;

/// The mutable ring pointers of one node. Always accessed under the node's
/// ring lock; the lock is released before any remote call.
#[derive(Debug)]
pub(crate) struct RingState {
    /// Next node clockwise. A node alone in the ring is its own successor.
    pub(crate) successor: String,
    /// Cached copy of the successor's own successor, the fallback route
    /// when the successor stops answering.
    pub(crate) successor_successor: Option<String>,
    pub(crate) predecessor: Option<String>,
    pub(crate) fingers: Vec<FingerEntry>,
}

impl RingState {
    /// The state of a node that has not met anyone yet: every pointer at
    /// itself, every finger at itself.
    pub(crate) fn singleton(addr: &str, id: RingId) -> RingState {
        RingState {
            successor: addr.to_string(),
            successor_successor: None,
            predecessor: None,
            fingers: (0..RING_BITS)
                .map(|index| FingerEntry {
                    target: id.finger_target(index),
                    addr: addr.to_string(),
                })
                .collect(),
        }
    }
}

impl<T: PeerTransport> NodeContext<T> {
    pub(crate) fn successor(&self) -> String {
        self.ring.lock().expect("ring lock poisoned").successor.clone()
    }

    pub(crate) fn predecessor(&self) -> Option<String> {
        self.ring
            .lock()
            .expect("ring lock poisoned")
            .predecessor
            .clone()
    }

    pub(crate) fn finger_table(&self) -> Vec<FingerEntry> {
        self.ring.lock().expect("ring lock poisoned").fingers.clone()
    }

    pub(crate) fn known_peers(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("peer lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn add_peer(&self, addr: &str) {
        if addr == self.config.addr {
            return;
        }
        self.peers
            .lock()
            .expect("peer lock poisoned")
            .insert(addr.to_string());
    }

    pub(crate) fn drop_peer(&self, addr: &str) {
        self.peers.lock().expect("peer lock poisoned").remove(addr);
    }

    /// The join choreography run by every node except the bootstrap one.
    /// Each step is best effort: a failed step is logged and the periodic
    /// maintenance rounds converge on whatever was missed.
    pub(crate) async fn join(&self) {
        let bootstrap = self.config.bootstrap_addr.clone();
        info!(node = %self.config.addr, %bootstrap, "joining ring");

        // Introduce ourselves and take the membership list and ledger the
        // discovery node hands back.
        match self
            .transport
            .call(
                &bootstrap,
                Request::Register {
                    addr: self.config.addr.clone(),
                },
            )
            .await
        {
            Ok(Response::Welcome { peers, chain }) => {
                for peer in peers {
                    self.add_peer(&peer);
                }
                self.add_peer(&bootstrap);
                let adopted = {
                    let mut local = self.chain.lock().expect("chain lock poisoned");
                    local.adopt_if_longer(chain)
                };
                match adopted {
                    Ok(true) => {
                        info!(node = %self.config.addr, "adopted the ring's chain at join");
                        self.scrub_pool_against_chain();
                        self.persist_chain().await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(node = %self.config.addr, error = %e, "welcome chain rejected")
                    }
                }
            }
            Ok(Response::Rejected { reason }) => {
                warn!(node = %self.config.addr, %reason, "registration rejected");
                self.add_peer(&bootstrap);
            }
            Ok(_) | Err(_) => {
                warn!(node = %self.config.addr, %bootstrap, "could not register with the discovery node");
            }
        }

        // Locate the node that should precede us in key responsibility.
        match self
            .transport
            .call(&bootstrap, Request::FindSuccessor { key: self.id })
            .await
        {
            Ok(Response::Address { addr: Some(succ) }) if succ != self.config.addr => {
                self.ring.lock().expect("ring lock poisoned").successor = succ;
            }
            _ => {
                warn!(node = %self.config.addr, "successor lookup failed, staying self-successor until stabilization");
            }
        }

        let successor = self.successor();
        if successor != self.config.addr {
            // Tell the successor about us, then have it stabilize right away
            // so the splice does not wait for its next periodic round.
            let _ = self
                .transport
                .call(
                    &successor,
                    Request::Notify {
                        candidate: self.config.addr.clone(),
                    },
                )
                .await;
            let _ = self.transport.call(&successor, Request::Stabilize).await;
        }

        self.fix_fingers().await;
        self.broadcast_finger_refresh().await;

        // Claim the keys that now fall to us.
        if successor != self.config.addr {
            let _ = self
                .transport
                .call(
                    &successor,
                    Request::HandoffFiles {
                        to: self.config.addr.clone(),
                    },
                )
                .await;
        }
        info!(node = %self.config.addr, %successor, "join complete");
    }

    /// Resolve which node a key belongs to. Falls back to our own successor
    /// when routing fails; a slightly stale answer beats no answer.
    pub(crate) async fn find_successor(&self, key: RingId) -> String {
        let successor = self.successor();
        let successor_id = RingId::hash_of(&successor);
        if key.is_between(&self.id, &successor_id) {
            return successor;
        }
        let mut target = self.closest_preceding_node(&key).await;
        if target == self.config.addr {
            target = successor.clone();
        }
        if target == self.config.addr {
            // Alone in the ring.
            return successor;
        }
        match self
            .transport
            .call(&target, Request::FindSuccessor { key })
            .await
        {
            Ok(Response::Address { addr: Some(addr) }) => addr,
            _ => {
                debug!(node = %self.config.addr, %target, "lookup delegation failed, answering with own successor");
                successor
            }
        }
    }

    /// Scan the finger table from the top for the live node closest below
    /// the key. Entries that fail a liveness check are skipped rather than
    /// repaired here; fix_fingers owns repair.
    async fn closest_preceding_node(&self, key: &RingId) -> String {
        let fingers = self.finger_table();
        for entry in fingers.iter().rev() {
            if entry.addr == self.config.addr {
                continue;
            }
            if entry.target.is_within(&self.id, key) && self.ping(&entry.addr).await {
                return entry.addr.clone();
            }
        }
        self.successor()
    }

    /// One stabilization round: verify the successor is alive and still the
    /// nearest clockwise node, route around it if dead, refresh the cached
    /// successor's successor, and re-announce ourselves.
    pub(crate) async fn stabilize(&self) {
        let successor = self.successor();
        if successor == self.config.addr {
            // Self-successor but with a predecessor means a second node has
            // arrived and the ring needs to close through it.
            if let Some(pred) = self.predecessor() {
                if pred != self.config.addr {
                    info!(node = %self.config.addr, successor = %pred, "closing ring through new predecessor");
                    self.ring.lock().expect("ring lock poisoned").successor = pred;
                }
            }
        } else if !self.ping(&successor).await {
            warn!(node = %self.config.addr, %successor, "successor unreachable");
            self.drop_peer(&successor);
            let fallback = {
                let mut ring = self.ring.lock().expect("ring lock poisoned");
                ring.successor_successor.take()
            };
            match fallback.filter(|addr| *addr != successor) {
                Some(next) => {
                    info!(node = %self.config.addr, successor = %next, "promoted successor's successor");
                    self.ring.lock().expect("ring lock poisoned").successor = next;
                }
                None => {
                    warn!(node = %self.config.addr, "no fallback successor cached, retrying next round");
                }
            }
        } else {
            // Has anyone spliced in between us and our successor?
            if let Ok(Response::Address { addr: Some(between) }) = self
                .transport
                .call(&successor, Request::GetPredecessor)
                .await
            {
                if between != self.config.addr {
                    let between_id = RingId::hash_of(&between);
                    let successor_id = RingId::hash_of(&successor);
                    if between_id.is_within(&self.id, &successor_id) {
                        info!(node = %self.config.addr, successor = %between, "adopted nearer successor");
                        self.ring.lock().expect("ring lock poisoned").successor = between;
                    }
                }
            }
        }

        let settled = self.successor();
        if settled == self.config.addr {
            return;
        }
        // Keep the escape route fresh, then make sure the successor knows
        // who precedes it.
        self.refresh_successor_successor(&settled).await;
        let _ = self
            .transport
            .call(
                &settled,
                Request::Notify {
                    candidate: self.config.addr.clone(),
                },
            )
            .await;
    }

    /// A peer believes it is our predecessor. Accept it when we have none,
    /// ours is dead, or the candidate sits strictly between the current
    /// predecessor and us. A displaced predecessor is told to stabilize so
    /// it discovers its new successor promptly.
    pub(crate) async fn notified(&self, candidate: String) {
        if candidate == self.config.addr {
            return;
        }
        self.add_peer(&candidate);
        let current = self.predecessor();
        let accept = match &current {
            None => true,
            Some(existing) if *existing == candidate => false,
            Some(existing) => {
                if !self.ping(existing).await {
                    true
                } else {
                    let candidate_id = RingId::hash_of(&candidate);
                    candidate_id.is_within(&RingId::hash_of(existing), &self.id)
                }
            }
        };
        if !accept {
            return;
        }
        info!(node = %self.config.addr, predecessor = %candidate, "accepted predecessor");
        self.ring.lock().expect("ring lock poisoned").predecessor = Some(candidate.clone());
        if let Some(displaced) = current {
            if displaced != candidate && displaced != self.config.addr {
                let _ = self.transport.call(&displaced, Request::Stabilize).await;
            }
        }
    }

    /// Recompute every finger by resolving its target key from scratch,
    /// then refresh the cached fallback successor along the way.
    pub(crate) async fn fix_fingers(&self) {
        for index in 0..RING_BITS {
            let target = self.id.finger_target(index);
            let owner = self.find_successor(target).await;
            let mut ring = self.ring.lock().expect("ring lock poisoned");
            ring.fingers[index as usize] = FingerEntry {
                target,
                addr: owner,
            };
        }
        let successor = self.successor();
        if successor != self.config.addr {
            self.refresh_successor_successor(&successor).await;
        }
    }

    /// Cache the successor's own successor as the route around a dead
    /// successor.
    async fn refresh_successor_successor(&self, successor: &str) {
        if let Ok(Response::Address { addr: Some(next) }) = self
            .transport
            .call(successor, Request::GetSuccessor)
            .await
        {
            if next != successor {
                self.ring
                    .lock()
                    .expect("ring lock poisoned")
                    .successor_successor = Some(next);
            }
        }
    }

    /// Forget a predecessor that no longer answers; the true one will
    /// re-announce itself through its own stabilization.
    pub(crate) async fn check_predecessor(&self) {
        let Some(pred) = self.predecessor() else {
            return;
        };
        if !self.ping(&pred).await {
            warn!(node = %self.config.addr, predecessor = %pred, "predecessor unreachable, clearing");
            self.drop_peer(&pred);
            self.ring.lock().expect("ring lock poisoned").predecessor = None;
        }
    }

    /// Graceful departure: push every stored file to the successor, go
    /// offline so liveness checks fail fast, close the ring through the
    /// predecessor, and tell everyone to rebuild their fingers.
    pub(crate) async fn leave(&self) {
        info!(node = %self.config.addr, "leaving the ring");
        let successor = self.successor();
        if successor != self.config.addr {
            self.relocate_all_files(&successor).await;
        }
        self.online
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.cancel_mining
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(pred) = self.predecessor() {
            if pred != self.config.addr {
                let _ = self.transport.call(&pred, Request::Stabilize).await;
            }
        }
        self.broadcast_finger_refresh().await;
    }

    /// Ask every known peer to rebuild its finger table. Peers that cannot
    /// be reached are forgotten.
    pub(crate) async fn broadcast_finger_refresh(&self) {
        self.broadcast(Request::FixFingers).await;
    }
}

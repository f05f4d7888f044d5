//! Document placement: the staging area where submitted bytes wait, the
//! vault of files this node owns, and the transfers that move files to
//! whichever node the ring says is responsible for them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{PlacementError, RpcError};
use crate::keyspace::{sha256_hex, RingId};
use crate::message::{Request, Response};
use crate::record::MaintenanceRecord;
use crate::transport::PeerTransport;

use super::NodeContext;

/// File storage for one node. Bytes live in memory as the authoritative
/// copy; nodes with a data dir also write them through to disk so a
/// restarted node can answer checksum queries for files it held.
pub(crate) struct FileVault {
    dir: Option<PathBuf>,
    staged: Mutex<HashMap<String, Vec<u8>>>,
    stored: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileVault {
    pub(crate) fn new(dir: Option<PathBuf>) -> FileVault {
        FileVault {
            dir,
            staged: Mutex::new(HashMap::new()),
            stored: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, filename: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join("files").join(filename))
    }

    /// Park submitted bytes until the matching record names an owner.
    pub(crate) fn stage(&self, filename: String, bytes: Vec<u8>) {
        self.staged
            .lock()
            .expect("staging lock poisoned")
            .insert(filename, bytes);
    }

    pub(crate) fn take_staged(&self, filename: &str) -> Option<Vec<u8>> {
        self.staged
            .lock()
            .expect("staging lock poisoned")
            .remove(filename)
    }

    /// Accept ownership of a file's bytes.
    pub(crate) async fn store(&self, filename: &str, bytes: Vec<u8>) -> std::io::Result<()> {
        if let Some(path) = self.file_path(filename) {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, &bytes).await?;
        }
        self.stored
            .lock()
            .expect("vault lock poisoned")
            .insert(filename.to_string(), bytes);
        Ok(())
    }

    pub(crate) async fn remove(&self, filename: &str) {
        self.stored.lock().expect("vault lock poisoned").remove(filename);
        if let Some(path) = self.file_path(filename) {
            let _ = fs::remove_file(path).await;
        }
    }

    pub(crate) fn has(&self, filename: &str) -> bool {
        self.stored
            .lock()
            .expect("vault lock poisoned")
            .contains_key(filename)
    }

    pub(crate) fn bytes_of(&self, filename: &str) -> Option<Vec<u8>> {
        self.stored
            .lock()
            .expect("vault lock poisoned")
            .get(filename)
            .cloned()
    }

    pub(crate) fn checksum(&self, filename: &str) -> Option<String> {
        self.stored
            .lock()
            .expect("vault lock poisoned")
            .get(filename)
            .map(|bytes| sha256_hex(bytes))
    }

    pub(crate) fn stored_filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stored
            .lock()
            .expect("vault lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl<T: PeerTransport> NodeContext<T> {
    /// Move a submitted record's staged bytes to the node the ring holds
    /// responsible for the filename. A record with nothing staged is left
    /// alone; gossiped records never carry bytes.
    pub(crate) async fn place_record(
        &self,
        record: &MaintenanceRecord,
    ) -> Result<(), PlacementError> {
        let Some(bytes) = self.vault.take_staged(&record.filename) else {
            debug!(node = %self.config.addr, filename = %record.filename, "no staged bytes, nothing to place");
            return Ok(());
        };
        let checksum = sha256_hex(&bytes);
        if checksum != record.fingerprint {
            // Put the bytes back so the submitter can inspect them.
            self.vault.stage(record.filename.clone(), bytes);
            return Err(PlacementError::ChecksumMismatch {
                filename: record.filename.clone(),
            });
        }
        let owner = self
            .find_successor(RingId::hash_of(&record.filename))
            .await;
        self.send_file(&owner, &record.filename, bytes, checksum)
            .await
    }

    /// Deliver file bytes to their owner and confirm the owner actually
    /// holds them before reporting success.
    pub(crate) async fn send_file(
        &self,
        owner: &str,
        filename: &str,
        bytes: Vec<u8>,
        checksum: String,
    ) -> Result<(), PlacementError> {
        if owner == self.config.addr {
            self.vault.store(filename, bytes).await?;
            info!(node = %self.config.addr, %filename, "stored file locally as its ring owner");
            return Ok(());
        }
        if !self.ping(owner).await {
            return Err(PlacementError::Rpc(RpcError::Unreachable(
                owner.to_string(),
            )));
        }
        match self
            .transport
            .call(
                owner,
                Request::StoreFile {
                    filename: filename.to_string(),
                    bytes,
                    checksum,
                },
            )
            .await
        {
            Ok(Response::Ack) => {}
            Ok(Response::Rejected { reason }) => {
                return Err(PlacementError::Rpc(RpcError::Rejected(reason)));
            }
            Ok(_) => return Err(PlacementError::Rpc(RpcError::UnexpectedReply)),
            Err(e) => return Err(e.into()),
        }
        // Trust but verify: the owner must answer for the file by name.
        match self
            .transport
            .call(
                owner,
                Request::HasFile {
                    filename: filename.to_string(),
                },
            )
            .await
        {
            Ok(Response::HasFile { present: true }) => {
                info!(node = %self.config.addr, %owner, %filename, "file placed with ring owner");
                Ok(())
            }
            _ => Err(PlacementError::OwnerUnconfirmed {
                owner: owner.to_string(),
                filename: filename.to_string(),
            }),
        }
    }

    /// Inbound file transfer. The checksum travels with the bytes and must
    /// match before anything is kept.
    pub(crate) async fn receive_file(
        &self,
        filename: String,
        bytes: Vec<u8>,
        checksum: String,
    ) -> Response {
        if sha256_hex(&bytes) != checksum {
            warn!(node = %self.config.addr, %filename, "rejected file transfer with mismatched checksum");
            return Response::Rejected {
                reason: "file bytes do not match the stated checksum".to_string(),
            };
        }
        match self.vault.store(&filename, bytes).await {
            Ok(()) => {
                info!(node = %self.config.addr, %filename, "stored file");
                Response::Ack
            }
            Err(e) => Response::Rejected {
                reason: format!("could not store file: {e}"),
            },
        }
    }

    /// A newly joined predecessor claims its share of our files: everything
    /// whose key no longer falls to us moves to it.
    pub(crate) async fn handoff_files(&self, to: &str) {
        if to == self.config.addr {
            return;
        }
        let newcomer_id = RingId::hash_of(to);
        for filename in self.vault.stored_filenames() {
            let key = RingId::hash_of(&filename);
            if key.is_between(&newcomer_id, &self.id) {
                // Still ours.
                continue;
            }
            let Some(bytes) = self.vault.bytes_of(&filename) else {
                continue;
            };
            let checksum = sha256_hex(&bytes);
            match self.send_file(to, &filename, bytes, checksum).await {
                Ok(()) => {
                    self.vault.remove(&filename).await;
                    info!(node = %self.config.addr, %to, %filename, "handed off file to new owner");
                }
                Err(e) => {
                    warn!(node = %self.config.addr, %to, %filename, error = %e, "file handoff failed");
                }
            }
        }
    }

    /// Departure-time relocation: push every stored file to the successor,
    /// which inherits our whole arc of the keyspace.
    pub(crate) async fn relocate_all_files(&self, successor: &str) {
        for filename in self.vault.stored_filenames() {
            let Some(bytes) = self.vault.bytes_of(&filename) else {
                continue;
            };
            let checksum = sha256_hex(&bytes);
            match self.send_file(successor, &filename, bytes, checksum).await {
                Ok(()) => {
                    self.vault.remove(&filename).await;
                }
                Err(e) => {
                    warn!(node = %self.config.addr, %successor, %filename, error = %e, "file relocation failed");
                }
            }
        }
    }
}

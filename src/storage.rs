use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::block::Block;

/// Durable storage for the chain: a JSON array of blocks at a well-known
/// path under the node's data directory, fully rewritten on every accepted
/// block and reloaded verbatim on restart.
#[derive(Debug, Clone)]
pub struct ChainStore {
    path: PathBuf,
}

impl ChainStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> ChainStore {
        ChainStore {
            path: data_dir.as_ref().join("blocks.json"),
        }
    }

    /// Load the stored chain. An absent file is not an error; it means the
    /// node should bootstrap from genesis. A corrupt file is logged and
    /// treated the same way.
    pub async fn load(&self) -> Option<Vec<Block>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => {
                info!(path = %self.path.display(), "no stored chain, bootstrapping from genesis");
                return None;
            }
        };
        match serde_json::from_str::<Vec<Block>>(&raw) {
            Ok(blocks) if !blocks.is_empty() => {
                info!(blocks = blocks.len(), "loaded stored chain");
                Some(blocks)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "stored chain unreadable, ignoring");
                None
            }
        }
    }

    /// Rewrite the whole chain file.
    pub async fn save(&self, blocks: &[Block]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_string_pretty(blocks)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Blockchain;

    #[tokio::test]
    async fn missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path());
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path());
        let chain = Blockchain::new(2);

        store.save(chain.blocks()).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, chain.blocks());
    }

    #[tokio::test]
    async fn corrupt_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(dir.path());
        fs::write(dir.path().join("blocks.json"), "not json").await.unwrap();
        assert!(store.load().await.is_none());
    }
}

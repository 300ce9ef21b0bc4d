use std::fs;
use std::path::{Path, PathBuf};

use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::forest::Forest;
use crate::node_id::NodeId;
use crate::types::{AccountInfo, Address, Hash, Key, Value};
use crate::update::Update;
use crate::witness::WitnessProof;
use crate::{MptConfig, StorageMode};

const META_FILE: &str = "meta.json";

#[derive(Serialize, Deserialize)]
struct LiveMetadata {
    root_node: u64,
}

/// The mutable head state: a single root over a forest.
///
/// Not thread-safe by itself; concurrent use requires outer synchronization.
pub struct LiveTrie {
    forest: Forest,
    root: NodeId,
    dir: Option<PathBuf>,
}

impl LiveTrie {
    /// Opens (or creates) a live trie stored under `dir`.
    pub fn open(dir: &Path, cfg: MptConfig) -> Result<Self, StoreError> {
        let forest = Forest::open(dir, cfg, StorageMode::Live)?;
        let root = match fs::read_to_string(dir.join(META_FILE)) {
            Ok(raw) => {
                let meta: LiveMetadata = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Corruption(format!("bad live metadata: {e}")))?;
                NodeId::from_bytes(meta.root_node.to_le_bytes())?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => NodeId::EMPTY,
            Err(err) => return Err(err.into()),
        };
        debug!(dir = %dir.display(), %root, "opened live trie");
        Ok(Self {
            forest,
            root,
            dir: Some(dir.to_path_buf()),
        })
    }

    /// A live trie without any backing files.
    pub fn in_memory(cfg: MptConfig) -> Result<Self, StoreError> {
        Ok(Self {
            forest: Forest::in_memory(cfg, StorageMode::Live)?,
            root: NodeId::EMPTY,
            dir: None,
        })
    }

    pub fn get_account_info(&self, address: &Address) -> Result<(AccountInfo, bool), StoreError> {
        self.forest.get_account_info(self.root, address)
    }

    pub fn set_account_info(
        &mut self,
        address: &Address,
        info: &AccountInfo,
    ) -> Result<(), StoreError> {
        self.root = self.forest.set_account_info(self.root, address, info)?;
        Ok(())
    }

    pub fn get_value(&self, address: &Address, key: &Key) -> Result<Value, StoreError> {
        self.forest.get_value(self.root, address, key)
    }

    pub fn set_value(
        &mut self,
        address: &Address,
        key: &Key,
        value: &Value,
    ) -> Result<(), StoreError> {
        self.root = self.forest.set_value(self.root, address, key, value)?;
        Ok(())
    }

    pub fn clear_storage(&mut self, address: &Address) -> Result<(), StoreError> {
        self.root = self.forest.clear_storage(self.root, address)?;
        Ok(())
    }

    /// Applies a block update. Returns the code blobs the update introduced;
    /// storing them is the caller's (external code store's) concern.
    pub fn apply(&mut self, mut update: Update) -> Result<Vec<(Hash, Vec<u8>)>, StoreError> {
        update.normalize();
        let (root, blobs) = update.apply(&self.forest, self.root)?;
        self.root = root;
        Ok(blobs)
    }

    /// The state root hash of the current head.
    pub fn get_hash(&self) -> Result<H256, StoreError> {
        self.forest.get_hash_for(self.root)
    }

    /// Extracts a witness proof for an account and a set of its slots.
    pub fn create_witness_proof(
        &self,
        address: &Address,
        keys: &[Key],
    ) -> Result<WitnessProof, StoreError> {
        WitnessProof::create(&self.forest, self.root, address, keys)
    }

    /// Verifies the structural invariants of the head trie.
    pub fn check(&self) -> Result<(), StoreError> {
        self.forest.check(self.root)
    }

    /// Persists all pending state, the root id included.
    ///
    /// Hashes are brought up to date first so a reopened instance never sees
    /// stale hash files.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.forest.get_hash_for(self.root)?;
        self.forest.flush()?;
        if let Some(dir) = &self.dir {
            let meta = LiveMetadata {
                root_node: u64::from_le_bytes(self.root.to_bytes()),
            };
            let raw = serde_json::to_string(&meta)
                .map_err(|e| StoreError::Corruption(format!("metadata encoding failed: {e}")))?;
            fs::write(dir.join(META_FILE), raw)?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        let mut errors = Vec::new();
        if let Err(err) = self.flush() {
            errors.push(err);
        }
        if let Err(err) = self.forest.close() {
            errors.push(err);
        }
        StoreError::join(errors)
    }

    /// The forest this trie lives in, for forest-level operations.
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// The current root node id, as persisted in the metadata file.
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn memory_footprint(&self) -> usize {
        self.forest.memory_footprint()
    }
}

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ethereum_types::H256;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::StoreError;
use crate::forest::Forest;
use crate::node_id::NodeId;
use crate::types::{AccountInfo, Address, Balance, Hash, Key, Nonce, Value};
use crate::update::Update;
use crate::witness::WitnessProof;
use crate::{MptConfig, StorageMode};

const ROOTS_FILE: &str = "roots.dat";

/// Append-only per-block history of frozen state roots over one forest.
///
/// Each `add` advances the head by one block: the update is applied on top of
/// the previous root, the result is frozen and hashed, and its root is
/// published. Structural sharing keeps unchanged subtrees common to all
/// blocks.
pub struct ArchiveTrie {
    forest: Forest,
    head: NodeId,
    roots: Vec<NodeId>,
    persisted_roots: usize,
    codes: FxHashMap<Hash, Vec<u8>>,
    dir: Option<PathBuf>,
}

impl ArchiveTrie {
    /// Opens (or creates) an archive stored under `dir`.
    pub fn open(dir: &Path, cfg: MptConfig) -> Result<Self, StoreError> {
        let forest = Forest::open(dir, cfg, StorageMode::Archive)?;
        let roots = match fs::read(dir.join(ROOTS_FILE)) {
            Ok(raw) => {
                if raw.len() % 8 != 0 {
                    return Err(StoreError::Corruption("truncated roots file".into()));
                }
                raw.chunks_exact(8)
                    .map(|chunk| {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(chunk);
                        NodeId::from_bytes(bytes)
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(dir = %dir.display(), blocks = roots.len(), "opened archive trie");
        Ok(Self {
            forest,
            head: roots.last().copied().unwrap_or(NodeId::EMPTY),
            persisted_roots: roots.len(),
            roots,
            codes: FxHashMap::default(),
            dir: Some(dir.to_path_buf()),
        })
    }

    /// An archive without any backing files.
    pub fn in_memory(cfg: MptConfig) -> Result<Self, StoreError> {
        Ok(Self {
            forest: Forest::in_memory(cfg, StorageMode::Archive)?,
            head: NodeId::EMPTY,
            roots: Vec::new(),
            persisted_roots: 0,
            codes: FxHashMap::default(),
            dir: None,
        })
    }

    /// Adds a block on top of the current head and publishes its root.
    ///
    /// Blocks at or below the current height are rejected; skipped heights are
    /// padded with the previous root. An empty update still freezes the head
    /// and publishes a root. Returns the block's state root hash.
    pub fn add(&mut self, block: u64, update: Update) -> Result<H256, StoreError> {
        if (block as usize) < self.roots.len() {
            return Err(StoreError::BlockAlreadyArchived(block));
        }
        while self.roots.len() < block as usize {
            self.roots.push(self.head);
        }
        let mut update = update;
        update.normalize();
        let (new_root, blobs) = update.apply(&self.forest, self.head)?;
        self.forest.freeze(new_root)?;
        let hash = self.forest.get_hash_for(new_root)?;
        for (code_hash, code) in blobs {
            self.codes.insert(code_hash, code);
        }
        self.head = new_root;
        self.roots.push(new_root);
        // Readers may only observe fully persisted roots.
        self.flush()?;
        debug!(block, root = %new_root, %hash, "archived block");
        Ok(hash)
    }

    fn root_at(&self, block: u64) -> Result<NodeId, StoreError> {
        self.roots
            .get(block as usize)
            .copied()
            .ok_or(StoreError::BlockOutOfRange(block))
    }

    pub fn get_account_info(
        &self,
        block: u64,
        address: &Address,
    ) -> Result<(AccountInfo, bool), StoreError> {
        self.forest.get_account_info(self.root_at(block)?, address)
    }

    pub fn get_balance(&self, block: u64, address: &Address) -> Result<Balance, StoreError> {
        Ok(self.get_account_info(block, address)?.0.balance)
    }

    pub fn get_nonce(&self, block: u64, address: &Address) -> Result<Nonce, StoreError> {
        Ok(self.get_account_info(block, address)?.0.nonce)
    }

    pub fn get_code_hash(&self, block: u64, address: &Address) -> Result<Hash, StoreError> {
        Ok(self.get_account_info(block, address)?.0.code_hash)
    }

    pub fn get_value(
        &self,
        block: u64,
        address: &Address,
        key: &Key,
    ) -> Result<Value, StoreError> {
        self.forest.get_value(self.root_at(block)?, address, key)
    }

    /// State root hash of the given block.
    pub fn get_hash(&self, block: u64) -> Result<H256, StoreError> {
        self.forest.get_hash_for(self.root_at(block)?)
    }

    /// Height of the newest archived block, or `None` when empty.
    pub fn get_last_block_height(&self) -> Option<u64> {
        self.roots.len().checked_sub(1).map(|h| h as u64)
    }

    /// Code bytes previously introduced through an update, by hash.
    pub fn get_code(&self, code_hash: &Hash) -> Option<&[u8]> {
        self.codes.get(code_hash).map(Vec::as_slice)
    }

    /// Extracts a witness proof against the given block's root.
    pub fn create_witness_proof(
        &self,
        block: u64,
        address: &Address,
        keys: &[Key],
    ) -> Result<WitnessProof, StoreError> {
        WitnessProof::create(&self.forest, self.root_at(block)?, address, keys)
    }

    /// Verifies the structural invariants of a block's trie.
    pub fn check(&self, block: u64) -> Result<(), StoreError> {
        self.forest.check(self.root_at(block)?)
    }

    /// Persists pending nodes, hashes, and any unpublished roots.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.forest.flush()?;
        if let Some(dir) = &self.dir {
            if self.persisted_roots < self.roots.len() {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(ROOTS_FILE))?;
                let mut bytes = Vec::with_capacity((self.roots.len() - self.persisted_roots) * 8);
                for root in &self.roots[self.persisted_roots..] {
                    bytes.extend_from_slice(&root.to_bytes());
                }
                file.write_all(&bytes)?;
                file.sync_data()?;
                self.persisted_roots = self.roots.len();
            }
        } else {
            self.persisted_roots = self.roots.len();
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

    pub fn memory_footprint(&self) -> usize {
        self.forest.memory_footprint()
            + self.roots.len() * 8
            + self.codes.values().map(Vec::len).sum::<usize>()
    }
}

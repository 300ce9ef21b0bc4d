use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use ethereum_types::H256;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::cache::{NodeCache, SharedNode};
use crate::error::StoreError;
use crate::hashstore::HashStore;
use crate::hasher::{NodeHasher, new_hasher};
use crate::nibbles::Nibbles;
use crate::node::{self, Node, NodeManager, NodeSource};
use crate::node_id::NodeId;
use crate::pool::NodePool;
use crate::types::{AccountInfo, Address, Key, Value};
use crate::{HasherKind, MptConfig, StorageMode};

/// Shared state of a forest: the typed pools, the node and hash caches, and
/// the two dirty sets. Everything behind the [`Forest`] facade and the
/// background flusher operates on this.
pub(crate) struct ForestInner {
    cfg: MptConfig,
    mode: StorageMode,
    pool: NodePool,
    cache: NodeCache,
    hashes: HashStore,
    dirty_nodes: Mutex<FxHashSet<NodeId>>,
    dirty_hashes: Mutex<FxHashSet<NodeId>>,
    hasher: Box<dyn NodeHasher>,
}

impl ForestInner {
    pub fn is_hash_dirty(&self, id: NodeId) -> bool {
        self.dirty_hashes.lock().contains(&id)
    }

    pub fn clear_hash_dirty(&self, id: NodeId) {
        self.dirty_hashes.lock().remove(&id);
    }

    pub fn stored_hash(&self, id: NodeId) -> H256 {
        self.hashes.get(id)
    }

    pub fn store_hash(&self, id: NodeId, hash: H256) {
        self.hashes.set(id, hash);
    }

    fn persist_evicted(&self, evicted: Vec<(NodeId, SharedNode)>) -> Result<(), StoreError> {
        for (id, shared) in evicted {
            let was_dirty = self.dirty_nodes.lock().remove(&id);
            if was_dirty {
                self.pool.set(id, &shared.read())?;
            }
        }
        Ok(())
    }
}

impl NodeSource for ForestInner {
    fn node(&self, id: NodeId) -> Result<SharedNode, StoreError> {
        if let Some(shared) = self.cache.get(id) {
            return Ok(shared);
        }
        let mut loaded = self.pool.get(id)?;
        if self.mode == StorageMode::Archive {
            // Everything persisted by an archive belongs to some frozen root.
            loaded.set_frozen();
        }
        let (shared, evicted) = self.cache.insert(id, loaded);
        self.persist_evicted(evicted)?;
        Ok(shared)
    }

    fn config(&self) -> &MptConfig {
        &self.cfg
    }
}

impl NodeManager for ForestInner {
    fn create(&self, node: Node) -> Result<NodeId, StoreError> {
        let id = self.pool.create(node.clone())?;
        let (_, evicted) = self.cache.insert(id, node);
        self.persist_evicted(evicted)?;
        self.update(id);
        Ok(id)
    }

    fn update(&self, id: NodeId) {
        self.dirty_nodes.lock().insert(id);
        self.dirty_hashes.lock().insert(id);
    }

    fn invalidate_hash(&self, id: NodeId) {
        self.dirty_hashes.lock().insert(id);
    }

    fn release(&self, id: NodeId) -> Result<(), StoreError> {
        self.cache.remove(id);
        self.dirty_nodes.lock().remove(&id);
        self.dirty_hashes.lock().remove(&id);
        self.hashes.forget(id);
        self.pool.delete(id)
    }
}

struct Flusher {
    stop: Sender<()>,
    handle: JoinHandle<Vec<StoreError>>,
}

/// A forest of state and storage tries over one shared node pool.
///
/// Reads are safe from multiple threads; mutation of any one root must come
/// from a single writer at a time.
pub struct Forest {
    inner: Arc<ForestInner>,
    flusher: Option<Flusher>,
}

impl Forest {
    /// Opens (or creates) a disk-backed forest under `dir`.
    pub fn open(dir: &Path, cfg: MptConfig, mode: StorageMode) -> Result<Self, StoreError> {
        validate_config(&cfg)?;
        let pool = NodePool::open(dir, cfg.page_cache_pages)?;
        let hashes = HashStore::open(&dir.join("hashes"), cfg.node_cache_capacity)?;
        Self::new(cfg, mode, pool, hashes)
    }

    /// A forest backed entirely by memory; used by tests and ephemeral tries.
    pub fn in_memory(cfg: MptConfig, mode: StorageMode) -> Result<Self, StoreError> {
        validate_config(&cfg)?;
        let pool = NodePool::in_memory();
        let hashes = HashStore::in_memory(cfg.node_cache_capacity);
        Self::new(cfg, mode, pool, hashes)
    }

    fn new(
        cfg: MptConfig,
        mode: StorageMode,
        pool: NodePool,
        hashes: HashStore,
    ) -> Result<Self, StoreError> {
        let hasher = new_hasher(cfg.hasher);
        let flush_period = cfg.flush_period;
        let inner = Arc::new(ForestInner {
            cache: NodeCache::new(cfg.node_cache_capacity),
            cfg,
            mode,
            pool,
            hashes,
            dirty_nodes: Mutex::new(FxHashSet::default()),
            dirty_hashes: Mutex::new(FxHashSet::default()),
            hasher,
        });
        let flusher = if flush_period.is_zero() {
            None
        } else {
            Some(spawn_flusher(inner.clone(), flush_period)?)
        };
        Ok(Self { inner, flusher })
    }

    pub(crate) fn inner(&self) -> &ForestInner {
        &self.inner
    }

    /// Looks up an account; the flag reports whether it exists.
    pub fn get_account_info(
        &self,
        root: NodeId,
        address: &Address,
    ) -> Result<(AccountInfo, bool), StoreError> {
        let path = node::address_path(&self.inner.cfg, address);
        Ok(match node::get_account(&*self.inner, root, address, &path)? {
            Some(info) => (info, true),
            None => (AccountInfo::default(), false),
        })
    }

    /// Writes an account's info and returns the new root.
    /// An empty info deletes the account along with its storage trie.
    pub fn set_account_info(
        &self,
        root: NodeId,
        address: &Address,
        info: &AccountInfo,
    ) -> Result<NodeId, StoreError> {
        let path = node::address_path(&self.inner.cfg, address);
        let (new_root, _) = node::set_account(&*self.inner, root, address, &path, info)?;
        Ok(new_root)
    }

    /// Reads a storage slot; absent slots read as zero.
    pub fn get_value(
        &self,
        root: NodeId,
        address: &Address,
        key: &Key,
    ) -> Result<Value, StoreError> {
        let path = node::address_path(&self.inner.cfg, address);
        let key_path = node::key_path(&self.inner.cfg, key);
        node::get_slot(&*self.inner, root, address, &path, key, &key_path)
    }

    /// Writes a storage slot and returns the new root.
    /// Writes to non-existing accounts are dropped; the zero value deletes the slot.
    pub fn set_value(
        &self,
        root: NodeId,
        address: &Address,
        key: &Key,
        value: &Value,
    ) -> Result<NodeId, StoreError> {
        let path = node::address_path(&self.inner.cfg, address);
        let key_path = node::key_path(&self.inner.cfg, key);
        let (new_root, _) =
            node::set_slot(&*self.inner, root, address, &path, key, &key_path, value)?;
        Ok(new_root)
    }

    /// Drops an account's whole storage trie, returning the new root.
    pub fn clear_storage(&self, root: NodeId, address: &Address) -> Result<NodeId, StoreError> {
        let path = node::address_path(&self.inner.cfg, address);
        let (new_root, _) = node::clear_storage(&*self.inner, root, address, &path)?;
        Ok(new_root)
    }

    /// Root hash of the trie at `root`, forcing recomputation of any dirty
    /// hashes reachable from it.
    pub fn get_hash_for(&self, root: NodeId) -> Result<H256, StoreError> {
        self.inner.hasher.hash_node(&self.inner, root)
    }

    /// Marks `root` and everything reachable from it immutable, so the
    /// subtree can be shared with later roots.
    pub fn freeze(&self, root: NodeId) -> Result<(), StoreError> {
        node::freeze(&*self.inner, root)
    }

    /// Verifies the structural invariants of the trie rooted at `root`.
    pub fn check(&self, root: NodeId) -> Result<(), StoreError> {
        node::check(&*self.inner, root, &Nibbles::default(), false)
    }

    /// Persists every dirty node and flushes the pools and hash files.
    pub fn flush(&self) -> Result<(), StoreError> {
        let dirty: Vec<NodeId> = self.inner.dirty_nodes.lock().iter().copied().collect();
        for id in dirty {
            match self.inner.cache.get(id) {
                Some(shared) => {
                    self.inner.pool.set(id, &shared.read())?;
                    self.inner.dirty_nodes.lock().remove(&id);
                }
                None => {
                    // Dirty nodes are persisted when evicted, so this is stale
                    // bookkeeping at worst.
                    warn!(%id, "dirty node missing from cache");
                    self.inner.dirty_nodes.lock().remove(&id);
                }
            }
        }
        self.inner.pool.flush()?;
        self.inner.hashes.flush()?;
        Ok(())
    }

    /// Stops the flusher, persists all state and releases the files.
    pub fn close(&mut self) -> Result<(), StoreError> {
        let mut errors = Vec::new();
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.stop.send(());
            match flusher.handle.join() {
                Ok(sweep_errors) => errors.extend(sweep_errors),
                Err(_) => errors.push(StoreError::Corruption("flusher thread panicked".into())),
            }
        }
        for result in [
            self.flush(),
            self.inner.pool.close(),
            self.inner.hashes.close(),
        ] {
            if let Err(err) = result {
                errors.push(err);
            }
        }
        StoreError::join(errors)
    }

    /// Canonical encoding of a node, as used for hashing and witness proofs.
    pub(crate) fn encode_node(&self, id: NodeId) -> Result<Vec<u8>, StoreError> {
        self.inner.hasher.encode_node(&self.inner, id)
    }

    pub(crate) fn hasher_kind(&self) -> HasherKind {
        self.inner.cfg.hasher
    }

    pub fn config(&self) -> &MptConfig {
        &self.inner.cfg
    }

    /// Approximate bytes held in memory by the pools, caches and dirty sets.
    pub fn memory_footprint(&self) -> usize {
        self.inner.pool.memory_footprint()
            + self.inner.cache.memory_footprint()
            + self.inner.hashes.memory_footprint()
            + (self.inner.dirty_nodes.lock().len() + self.inner.dirty_hashes.lock().len()) * 8
    }
}

fn validate_config(cfg: &MptConfig) -> Result<(), StoreError> {
    if cfg.hasher == HasherKind::Mpt && !(cfg.hashed_paths && cfg.track_suffix_len) {
        return Err(StoreError::UnsupportedConfiguration(
            "the Ethereum hasher requires hashed paths and tracked suffix lengths".into(),
        ));
    }
    Ok(())
}

fn spawn_flusher(inner: Arc<ForestInner>, period: Duration) -> Result<Flusher, StoreError> {
    let (stop, rx) = channel::bounded::<()>(1);
    let handle = std::thread::Builder::new()
        .name("mpt-flusher".into())
        .spawn(move || {
            let mut errors = Vec::new();
            loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => sweep(&inner, &mut errors, false),
                    // Stop signal or a dropped forest: drain and exit.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        sweep(&inner, &mut errors, true);
                        break;
                    }
                }
            }
            errors
        })?;
    Ok(Flusher { stop, handle })
}

/// One flusher pass over the node cache: persist nodes that are dirty but
/// whose hash is clean, taking each node's lock without blocking. The final
/// pass before shutdown blocks on the locks to drain the queue.
fn sweep(inner: &ForestInner, errors: &mut Vec<StoreError>, drain: bool) {
    let mut flushed = 0usize;
    for (id, shared) in inner.cache.snapshot() {
        if !inner.dirty_nodes.lock().contains(&id) {
            continue;
        }
        if inner.is_hash_dirty(id) {
            // Persisting now would be wasted work: the pending hash
            // recomputation may still restructure this node.
            continue;
        }
        let guard = if drain {
            Some(shared.write())
        } else {
            shared.try_write()
        };
        let Some(guard) = guard else { continue };
        match inner.pool.set(id, &guard) {
            Ok(()) => {
                inner.dirty_nodes.lock().remove(&id);
                flushed += 1;
            }
            Err(err) => {
                warn!(%id, %err, "background flush of node failed");
                errors.push(err);
            }
        }
    }
    if flushed > 0 {
        debug!(flushed, drain, "flusher sweep persisted nodes");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ethereum_types::U256;

    fn forest(mode: StorageMode) -> Forest {
        let cfg = MptConfig {
            flush_period: Duration::ZERO,
            ..MptConfig::ethereum()
        };
        Forest::in_memory(cfg, mode).expect("forest")
    }

    fn info(nonce: u64, balance: u64) -> AccountInfo {
        AccountInfo {
            nonce,
            balance: U256::from(balance),
            ..Default::default()
        }
    }

    #[test]
    fn frozen_roots_are_superseded_not_mutated() {
        let forest = forest(StorageMode::Archive);
        let address = Address::repeat_byte(0x01);
        let mut root = NodeId::EMPTY;
        root = forest
            .set_account_info(root, &address, &info(1, 100))
            .expect("set");
        forest.freeze(root).expect("freeze");
        let frozen_hash = forest.get_hash_for(root).expect("hash");

        let new_root = forest
            .set_account_info(root, &address, &info(2, 200))
            .expect("set");
        assert_ne!(new_root, root);

        // The frozen root still reads and hashes the original state.
        let (old, present) = forest.get_account_info(root, &address).expect("read");
        assert!(present);
        assert_eq!(old, info(1, 100));
        assert_eq!(forest.get_hash_for(root).expect("hash"), frozen_hash);

        let (new, _) = forest.get_account_info(new_root, &address).expect("read");
        assert_eq!(new, info(2, 200));
        assert_ne!(forest.get_hash_for(new_root).expect("hash"), frozen_hash);
    }

    #[test]
    fn frozen_roots_share_untouched_subtrees() {
        let forest = forest(StorageMode::Archive);
        let mut root = NodeId::EMPTY;
        for byte in 1..=6u8 {
            root = forest
                .set_account_info(root, &Address::repeat_byte(byte), &info(byte as u64, 10))
                .expect("set");
        }
        forest.freeze(root).expect("freeze");
        let new_root = forest
            .set_account_info(root, &Address::repeat_byte(1), &info(1, 11))
            .expect("set");

        // Both roots answer for every account.
        for byte in 2..=6u8 {
            let address = Address::repeat_byte(byte);
            let (a, _) = forest.get_account_info(root, &address).expect("read");
            let (b, _) = forest.get_account_info(new_root, &address).expect("read");
            assert_eq!(a, b);
        }
        forest.check(root).expect("old root invariants");
        forest.check(new_root).expect("new root invariants");
    }

    #[test]
    fn deleting_everything_returns_the_empty_root() {
        let forest = forest(StorageMode::Live);
        let address = Address::repeat_byte(0x2a);
        let mut root = NodeId::EMPTY;
        root = forest
            .set_account_info(root, &address, &info(1, 1))
            .expect("set");
        root = forest
            .set_value(root, &address, &Key::repeat_byte(1), &Value::repeat_byte(1))
            .expect("slot");
        root = forest
            .set_account_info(root, &address, &AccountInfo::default())
            .expect("delete");
        assert!(root.is_empty());
        assert_eq!(
            forest.get_hash_for(root).expect("hash"),
            *crate::EMPTY_TRIE_HASH
        );
    }

    #[test]
    fn released_subtrees_free_their_pool_slots() {
        let forest = forest(StorageMode::Live);
        let address = Address::repeat_byte(0x0b);
        let mut root = NodeId::EMPTY;
        root = forest
            .set_account_info(root, &address, &info(1, 1))
            .expect("set");
        let first = root;
        root = forest
            .set_account_info(root, &address, &AccountInfo::default())
            .expect("delete");
        assert!(root.is_empty());
        // FIFO reuse hands the freed account slot to the next allocation.
        let reused = forest
            .set_account_info(NodeId::EMPTY, &address, &info(9, 9))
            .expect("set");
        assert_eq!(reused, first);
    }

    #[test]
    fn hash_is_stable_until_the_next_modification() {
        let forest = forest(StorageMode::Live);
        let address = Address::repeat_byte(0x33);
        let root = forest
            .set_account_info(NodeId::EMPTY, &address, &info(1, 1))
            .expect("set");
        let first = forest.get_hash_for(root).expect("hash");
        assert_eq!(forest.get_hash_for(root).expect("hash"), first);
        let root = forest
            .set_value(root, &address, &Key::repeat_byte(1), &Value::repeat_byte(1))
            .expect("slot");
        assert_ne!(forest.get_hash_for(root).expect("hash"), first);
    }
}

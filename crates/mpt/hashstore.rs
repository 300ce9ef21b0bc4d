use std::fs::{self, File, OpenOptions};
use std::path::Path;

use ethereum_types::H256;
use memmap2::MmapMut;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cache::LruMap;
use crate::error::StoreError;
use crate::node_id::{NodeId, NodeKind};

const HASH_LEN: usize = 32;
/// Files grow in whole chunks to keep remapping rare.
const GROW_CHUNK: u64 = (HASH_LEN * 4096) as u64;

const KIND_FILES: [&str; 4] = [
    "branches.dat",
    "extensions.dat",
    "accounts.dat",
    "values.dat",
];

enum HashColumn {
    Mem(Vec<u8>),
    File { file: File, map: Option<MmapMut> },
}

impl HashColumn {
    fn get(&self, index: u64) -> H256 {
        let offset = index as usize * HASH_LEN;
        let bytes: &[u8] = match self {
            HashColumn::Mem(bytes) => bytes,
            HashColumn::File { map, .. } => match map {
                Some(map) => map,
                None => return H256::zero(),
            },
        };
        if offset + HASH_LEN <= bytes.len() {
            H256::from_slice(&bytes[offset..offset + HASH_LEN])
        } else {
            // Never-written entries read as the zero hash.
            H256::zero()
        }
    }

    fn set(&mut self, index: u64, hash: &H256) -> Result<(), StoreError> {
        let offset = index as usize * HASH_LEN;
        match self {
            HashColumn::Mem(bytes) => {
                if bytes.len() < offset + HASH_LEN {
                    bytes.resize(offset + HASH_LEN, 0);
                }
                bytes[offset..offset + HASH_LEN].copy_from_slice(hash.as_bytes());
            }
            HashColumn::File { file, map } => {
                let needed = (offset + HASH_LEN) as u64;
                let current = file.metadata()?.len();
                if current < needed || map.is_none() {
                    if let Some(old) = map.take() {
                        old.flush()?;
                    }
                    if current < needed {
                        file.set_len(needed.div_ceil(GROW_CHUNK) * GROW_CHUNK)?;
                    }
                    *map = Some(unsafe { MmapMut::map_mut(&*file)? });
                }
                if let Some(map) = map {
                    map[offset..offset + HASH_LEN].copy_from_slice(hash.as_bytes());
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if let HashColumn::File { map: Some(map), .. } = self {
            map.flush()?;
        }
        Ok(())
    }

    fn memory_footprint(&self) -> usize {
        match self {
            HashColumn::Mem(bytes) => bytes.len(),
            HashColumn::File { .. } => 0,
        }
    }
}

/// Node-id-keyed persistent map of node hashes.
///
/// Hashes live in one dense file per node kind, indexed by pool index, with a
/// bounded read cache and a dirty set for write-through. `get` of an id that
/// was never set returns the zero hash.
pub(crate) struct HashStore {
    columns: [Mutex<HashColumn>; 4],
    cache: Mutex<LruMap<NodeId, H256>>,
    dirty: Mutex<FxHashMap<NodeId, H256>>,
}

impl HashStore {
    pub fn in_memory(cache_capacity: usize) -> Self {
        Self {
            columns: [
                Mutex::new(HashColumn::Mem(Vec::new())),
                Mutex::new(HashColumn::Mem(Vec::new())),
                Mutex::new(HashColumn::Mem(Vec::new())),
                Mutex::new(HashColumn::Mem(Vec::new())),
            ],
            cache: Mutex::new(LruMap::new(cache_capacity)),
            dirty: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn open(dir: &Path, cache_capacity: usize) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let mut columns = Vec::with_capacity(4);
        for name in KIND_FILES {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.join(name))?;
            let map = match file.metadata()?.len() {
                0 => None,
                _ => Some(unsafe { MmapMut::map_mut(&file)? }),
            };
            columns.push(Mutex::new(HashColumn::File { file, map }));
        }
        debug!(dir = %dir.display(), "opened hash store");
        let columns: [Mutex<HashColumn>; 4] = columns
            .try_into()
            .map_err(|_| StoreError::Corruption("hash column construction failed".into()))?;
        Ok(Self {
            columns,
            cache: Mutex::new(LruMap::new(cache_capacity)),
            dirty: Mutex::new(FxHashMap::default()),
        })
    }

    fn column_of(id: NodeId) -> usize {
        match id.kind() {
            NodeKind::Branch => 0,
            NodeKind::Extension => 1,
            NodeKind::Account => 2,
            NodeKind::Value => 3,
            NodeKind::Empty => unreachable!("empty node has no stored hash"),
        }
    }

    /// Returns the last value set for `id`, or the zero hash if none.
    pub fn get(&self, id: NodeId) -> H256 {
        if let Some(hash) = self.dirty.lock().get(&id) {
            return *hash;
        }
        if let Some(hash) = self.cache.lock().get(&id) {
            return *hash;
        }
        let hash = self.columns[Self::column_of(id)].lock().get(id.index());
        let mut cache = self.cache.lock();
        cache.insert(id, hash);
        while cache.is_over_capacity() {
            if cache.pop_lru_if(|_, _| true).is_none() {
                break;
            }
        }
        hash
    }

    pub fn set(&self, id: NodeId, hash: H256) {
        self.dirty.lock().insert(id, hash);
        let mut cache = self.cache.lock();
        cache.insert(id, hash);
        while cache.is_over_capacity() {
            if cache.pop_lru_if(|_, _| true).is_none() {
                break;
            }
        }
    }

    /// Drops a released node's pending hash so it is never written out.
    pub fn forget(&self, id: NodeId) {
        self.dirty.lock().remove(&id);
        self.cache.lock().remove(&id);
    }

    /// Persists all dirty entries in ascending id order.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut entries: Vec<(NodeId, H256)> = self.dirty.lock().drain().collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        for (id, hash) in entries {
            self.columns[Self::column_of(id)]
                .lock()
                .set(id.index(), &hash)?;
        }
        for column in &self.columns {
            column.lock().flush()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.flush()
    }

    pub fn memory_footprint(&self) -> usize {
        let columns: usize = self
            .columns
            .iter()
            .map(|c| c.lock().memory_footprint())
            .sum();
        columns
            + self.cache.lock().len() * (8 + HASH_LEN)
            + self.dirty.lock().len() * (8 + HASH_LEN)
    }
}

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::node::Node;
use crate::node_id::NodeId;

const NIL: usize = usize::MAX;

struct LruEntry<K, V> {
    key: K,
    value: Option<V>,
    prev: usize,
    next: usize,
}

/// A bounded map with least-recently-used eviction order.
///
/// The map never evicts on its own: callers check [`LruMap::is_over_capacity`]
/// and pick victims with [`LruMap::pop_lru_if`], so entries that must not be
/// dropped (locked nodes, busy pages) can be skipped.
pub struct LruMap<K, V> {
    map: FxHashMap<K, usize>,
    entries: Vec<LruEntry<K, V>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Copy, V> LruMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: FxHashMap::default(),
            entries: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_over_capacity(&self) -> bool {
        self.len() > self.capacity
    }

    /// Looks up a key, marking the entry as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.map.get(key)?;
        self.promote(slot);
        self.entries[slot].value.as_ref()
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.map.get(key)?;
        self.promote(slot);
        self.entries[slot].value.as_mut()
    }

    /// Looks up a key without touching the usage order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.map.get(key)?;
        self.entries[slot].value.as_ref()
    }

    /// Inserts an entry as most recently used.
    /// Returns the previous value when the key was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&slot) = self.map.get(&key) {
            self.promote(slot);
            return self.entries[slot].value.replace(value);
        }
        let entry = LruEntry {
            key,
            value: Some(value),
            prev: NIL,
            next: self.head,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        if self.head != NIL {
            self.entries[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
        self.map.insert(key, slot);
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.map.remove(key)?;
        self.unlink(slot);
        self.free.push(slot);
        self.entries[slot].value.take()
    }

    /// Removes and returns the least recently used entry accepted by `accept`,
    /// scanning from the LRU end. Returns None if every entry is rejected.
    pub fn pop_lru_if(&mut self, mut accept: impl FnMut(&K, &V) -> bool) -> Option<(K, V)> {
        let mut slot = self.tail;
        while slot != NIL {
            let prev = self.entries[slot].prev;
            let accepted = match &self.entries[slot].value {
                Some(value) => accept(&self.entries[slot].key, value),
                None => false,
            };
            if accepted {
                let key = self.entries[slot].key;
                self.map.remove(&key);
                self.unlink(slot);
                self.free.push(slot);
                return self.entries[slot].value.take().map(|value| (key, value));
            }
            slot = prev;
        }
        None
    }

    /// Visits every entry in no particular order.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for slot in self.map.values() {
            let entry = &self.entries[*slot];
            if let Some(value) = &entry.value {
                f(&entry.key, value);
            }
        }
    }

    fn promote(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.entries[slot].next = self.head;
        if self.head != NIL {
            self.entries[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.entries[slot].prev, self.entries[slot].next);
        if prev != NIL {
            self.entries[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.entries[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.entries[slot].prev = NIL;
        self.entries[slot].next = NIL;
    }
}

/// Shared handle to a cached node.
pub type SharedNode = Arc<RwLock<Node>>;

/// Bounded cache of loaded nodes with per-node reader/writer locks.
///
/// Eviction skips nodes that are currently locked or referenced outside the
/// cache; the evicted entries are handed back so the forest can persist the
/// dirty ones.
pub struct NodeCache {
    inner: Mutex<LruMap<NodeId, SharedNode>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruMap::new(capacity)),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<SharedNode> {
        self.inner.lock().get(&id).cloned()
    }

    /// Inserts a node, returning its shared handle along with any entries
    /// evicted to stay within capacity.
    pub fn insert(&self, id: NodeId, node: Node) -> (SharedNode, Vec<(NodeId, SharedNode)>) {
        let shared: SharedNode = Arc::new(RwLock::new(node));
        let mut inner = self.inner.lock();
        inner.insert(id, shared.clone());
        let mut evicted = Vec::new();
        while inner.is_over_capacity() {
            let victim = inner.pop_lru_if(|key, node| {
                *key != id && Arc::strong_count(node) == 1 && node.try_write().is_some()
            });
            match victim {
                Some(entry) => evicted.push(entry),
                // Everything is pinned; allow the cache to run over capacity.
                None => break,
            }
        }
        (shared, evicted)
    }

    pub fn remove(&self, id: NodeId) -> Option<SharedNode> {
        self.inner.lock().remove(&id)
    }

    /// Snapshot of the current entries, for flusher sweeps.
    pub fn snapshot(&self) -> Vec<(NodeId, SharedNode)> {
        let inner = self.inner.lock();
        let mut entries = Vec::with_capacity(inner.len());
        inner.for_each(|id, node| entries.push((*id, node.clone())));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn memory_footprint(&self) -> usize {
        self.inner.lock().len() * std::mem::size_of::<Node>()
    }
}

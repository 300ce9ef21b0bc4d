use std::collections::VecDeque;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::nibbles::{self, Nibbles};
use crate::node::{AccountNode, BranchNode, ExtensionNode, Node, ValueNode};
use crate::node_id::{NodeId, NodeKind};
use crate::paged::PagedStore;
use crate::types::{AccountInfo, Address, Hash};
use ethereum_types::U256;

/// Fixed-width on-disk image of a node kind.
///
/// Volatile state (frozen flag, embedded caches) is not part of the record;
/// it is reconstructed when a node is loaded.
pub(crate) trait Record: Clone + Send + Sync + 'static {
    const SIZE: usize;
    fn write_record(&self, buf: &mut [u8]);
    fn read_record(buf: &[u8]) -> Result<Self, StoreError>;
}

impl Record for BranchNode {
    const SIZE: usize = 16 * 8;

    fn write_record(&self, buf: &mut [u8]) {
        for (i, child) in self.children.iter().enumerate() {
            buf[i * 8..(i + 1) * 8].copy_from_slice(&child.to_bytes());
        }
    }

    fn read_record(buf: &[u8]) -> Result<Self, StoreError> {
        let mut children = [NodeId::EMPTY; 16];
        for (i, child) in children.iter_mut().enumerate() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
            *child = NodeId::from_bytes(bytes)?;
        }
        Ok(BranchNode::new(children))
    }
}

impl Record for ExtensionNode {
    const SIZE: usize = nibbles::ENCODED_LEN + 8;

    fn write_record(&self, buf: &mut [u8]) {
        buf[..nibbles::ENCODED_LEN].copy_from_slice(&self.path.to_disk());
        buf[nibbles::ENCODED_LEN..].copy_from_slice(&self.child.to_bytes());
    }

    fn read_record(buf: &[u8]) -> Result<Self, StoreError> {
        let path = Nibbles::from_disk(&buf[..nibbles::ENCODED_LEN])?;
        let mut child = [0u8; 8];
        child.copy_from_slice(&buf[nibbles::ENCODED_LEN..]);
        Ok(ExtensionNode::new(path, NodeId::from_bytes(child)?))
    }
}

impl Record for AccountNode {
    // address + nonce + balance + code hash + storage root + suffix length
    const SIZE: usize = 20 + 8 + 32 + 32 + 8 + 1;

    fn write_record(&self, buf: &mut [u8]) {
        buf[..20].copy_from_slice(self.address.as_bytes());
        buf[20..28].copy_from_slice(&self.info.nonce.to_be_bytes());
        buf[28..60].copy_from_slice(&self.info.balance.to_big_endian());
        buf[60..92].copy_from_slice(self.info.code_hash.as_bytes());
        buf[92..100].copy_from_slice(&self.storage.to_bytes());
        buf[100] = self.suffix_len;
    }

    fn read_record(buf: &[u8]) -> Result<Self, StoreError> {
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&buf[20..28]);
        let mut storage = [0u8; 8];
        storage.copy_from_slice(&buf[92..100]);
        let info = AccountInfo {
            nonce: u64::from_be_bytes(nonce),
            balance: U256::from_big_endian(&buf[28..60]),
            code_hash: Hash::from_slice(&buf[60..92]),
        };
        let mut node = AccountNode::new(Address::from_slice(&buf[..20]), info, buf[100]);
        node.storage = NodeId::from_bytes(storage)?;
        Ok(node)
    }
}

impl Record for ValueNode {
    // key + value + suffix length
    const SIZE: usize = 32 + 32 + 1;

    fn write_record(&self, buf: &mut [u8]) {
        buf[..32].copy_from_slice(self.key.as_bytes());
        buf[32..64].copy_from_slice(self.value.as_bytes());
        buf[64] = self.suffix_len;
    }

    fn read_record(buf: &[u8]) -> Result<Self, StoreError> {
        Ok(ValueNode::new(
            Hash::from_slice(&buf[..32]),
            Hash::from_slice(&buf[32..64]),
            buf[64],
        ))
    }
}

/// One append+free collection of fixed-width records.
///
/// `create` hands out a fresh or recycled index; freed indices are reused in
/// FIFO order. The only correctness requirement is that `get` returns the last
/// `set` image for every allocated index.
pub(crate) trait RecordStore<R: Record>: Send + Sync {
    fn create(&mut self, record: R) -> Result<u64, StoreError>;
    fn get(&mut self, index: u64) -> Result<R, StoreError>;
    fn set(&mut self, index: u64, record: &R) -> Result<(), StoreError>;
    fn delete(&mut self, index: u64) -> Result<(), StoreError>;
    fn flush(&mut self) -> Result<(), StoreError>;
    fn close(&mut self) -> Result<(), StoreError>;
    fn memory_footprint(&self) -> usize;
}

/// Vector-backed store used by in-memory instances and tests.
pub(crate) struct InMemoryStore<R> {
    records: Vec<Option<R>>,
    free: VecDeque<u64>,
}

impl<R> InMemoryStore<R> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            free: VecDeque::new(),
        }
    }
}

impl<R: Record> RecordStore<R> for InMemoryStore<R> {
    fn create(&mut self, record: R) -> Result<u64, StoreError> {
        match self.free.pop_front() {
            Some(index) => {
                self.records[index as usize] = Some(record);
                Ok(index)
            }
            None => {
                self.records.push(Some(record));
                Ok(self.records.len() as u64 - 1)
            }
        }
    }

    fn get(&mut self, index: u64) -> Result<R, StoreError> {
        self.records
            .get(index as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| StoreError::Corruption(format!("no node at pool index {index}")))
    }

    fn set(&mut self, index: u64, record: &R) -> Result<(), StoreError> {
        let slot = self
            .records
            .get_mut(index as usize)
            .ok_or_else(|| StoreError::Corruption(format!("no node at pool index {index}")))?;
        *slot = Some(record.clone());
        Ok(())
    }

    fn delete(&mut self, index: u64) -> Result<(), StoreError> {
        let slot = self
            .records
            .get_mut(index as usize)
            .ok_or_else(|| StoreError::Corruption(format!("no node at pool index {index}")))?;
        *slot = None;
        self.free.push_back(index);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn memory_footprint(&self) -> usize {
        self.records.len() * std::mem::size_of::<Option<R>>() + self.free.len() * 8
    }
}

/// The four typed stocks backing a forest, one per node kind.
pub(crate) struct NodePool {
    branches: Mutex<Box<dyn RecordStore<BranchNode>>>,
    extensions: Mutex<Box<dyn RecordStore<ExtensionNode>>>,
    accounts: Mutex<Box<dyn RecordStore<AccountNode>>>,
    values: Mutex<Box<dyn RecordStore<ValueNode>>>,
}

impl NodePool {
    pub fn in_memory() -> Self {
        Self {
            branches: Mutex::new(Box::new(InMemoryStore::new())),
            extensions: Mutex::new(Box::new(InMemoryStore::new())),
            accounts: Mutex::new(Box::new(InMemoryStore::new())),
            values: Mutex::new(Box::new(InMemoryStore::new())),
        }
    }

    pub fn open(dir: &Path, page_cache_pages: usize) -> Result<Self, StoreError> {
        Ok(Self {
            branches: Mutex::new(Box::new(PagedStore::open(
                &dir.join("branches"),
                page_cache_pages,
            )?)),
            extensions: Mutex::new(Box::new(PagedStore::open(
                &dir.join("extensions"),
                page_cache_pages,
            )?)),
            accounts: Mutex::new(Box::new(PagedStore::open(
                &dir.join("accounts"),
                page_cache_pages,
            )?)),
            values: Mutex::new(Box::new(PagedStore::open(
                &dir.join("values"),
                page_cache_pages,
            )?)),
        })
    }

    pub fn create(&self, node: Node) -> Result<NodeId, StoreError> {
        match node {
            Node::Branch(n) => Ok(NodeId::branch(self.branches.lock().create(n)?)),
            Node::Extension(n) => Ok(NodeId::extension(self.extensions.lock().create(n)?)),
            Node::Account(n) => Ok(NodeId::account(self.accounts.lock().create(n)?)),
            Node::Value(n) => Ok(NodeId::value(self.values.lock().create(n)?)),
        }
    }

    pub fn get(&self, id: NodeId) -> Result<Node, StoreError> {
        match id.kind() {
            NodeKind::Empty => Err(StoreError::Corruption(
                "attempted to load the empty node".into(),
            )),
            NodeKind::Branch => Ok(Node::Branch(self.branches.lock().get(id.index())?)),
            NodeKind::Extension => Ok(Node::Extension(self.extensions.lock().get(id.index())?)),
            NodeKind::Account => Ok(Node::Account(self.accounts.lock().get(id.index())?)),
            NodeKind::Value => Ok(Node::Value(self.values.lock().get(id.index())?)),
        }
    }

    pub fn set(&self, id: NodeId, node: &Node) -> Result<(), StoreError> {
        match (id.kind(), node) {
            (NodeKind::Branch, Node::Branch(n)) => self.branches.lock().set(id.index(), n),
            (NodeKind::Extension, Node::Extension(n)) => self.extensions.lock().set(id.index(), n),
            (NodeKind::Account, Node::Account(n)) => self.accounts.lock().set(id.index(), n),
            (NodeKind::Value, Node::Value(n)) => self.values.lock().set(id.index(), n),
            (kind, _) => Err(StoreError::InvariantViolation(format!(
                "node kind does not match id kind {kind:?}"
            ))),
        }
    }

    pub fn delete(&self, id: NodeId) -> Result<(), StoreError> {
        match id.kind() {
            NodeKind::Empty => Ok(()),
            NodeKind::Branch => self.branches.lock().delete(id.index()),
            NodeKind::Extension => self.extensions.lock().delete(id.index()),
            NodeKind::Account => self.accounts.lock().delete(id.index()),
            NodeKind::Value => self.values.lock().delete(id.index()),
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.branches.lock().flush()?;
        self.extensions.lock().flush()?;
        self.accounts.lock().flush()?;
        self.values.lock().flush()?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.branches.lock().close()?;
        self.extensions.lock().close()?;
        self.accounts.lock().close()?;
        self.values.lock().close()?;
        Ok(())
    }

    pub fn memory_footprint(&self) -> usize {
        self.branches.lock().memory_footprint()
            + self.extensions.lock().memory_footprint()
            + self.accounts.lock().memory_footprint()
            + self.values.lock().memory_footprint()
    }
}

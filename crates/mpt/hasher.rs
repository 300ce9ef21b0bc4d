use arbor_rlp::constants::RLP_NULL;
use arbor_rlp::encode::{RLPEncode, encode_length};
use arbor_rlp::structs::Encoder;
use ethereum_types::H256;
use sha2::{Digest as _, Sha256};

use crate::error::StoreError;
use crate::forest::ForestInner;
use crate::nibbles::Nibbles;
use crate::node::{self, Node, NodeSource};
use crate::node_id::NodeId;
use crate::types::{EMPTY_CODE_HASH, keccak};
use crate::{EMPTY_TRIE_HASH, HasherKind};

/// Hashing capability of a forest, chosen at open time.
///
/// `hash_node` must be reentrant: concurrent calls may recompute the same
/// dirty hash, which is wasteful but converges to the same value.
pub(crate) trait NodeHasher: Send + Sync {
    /// Hash of an empty trie under this scheme.
    fn empty_hash(&self) -> H256;

    /// Returns the node's hash, computing, persisting and un-dirtying any
    /// stale hashes in the subtree as needed.
    fn hash_node(&self, forest: &ForestInner, id: NodeId) -> Result<H256, StoreError>;

    /// The canonical encoding of the node, i.e. the preimage of its hash.
    fn encode_node(&self, forest: &ForestInner, id: NodeId) -> Result<Vec<u8>, StoreError>;
}

pub(crate) fn new_hasher(kind: HasherKind) -> Box<dyn NodeHasher> {
    match kind {
        HasherKind::Mpt => Box::new(MptHasher),
        HasherKind::Direct => Box::new(DirectHasher),
    }
}

enum ChildRef {
    Empty,
    /// The child's RLP is shorter than 32 bytes and is inlined verbatim.
    Embedded(Vec<u8>),
    Hashed(H256),
}

impl ChildRef {
    fn is_embedded(&self) -> bool {
        matches!(self, ChildRef::Embedded(_))
    }
}

/// Ethereum-compatible hasher: per-node RLP with hex-prefix encoded paths,
/// Keccak-256, and sub-32-byte children embedded in their parent.
pub(crate) struct MptHasher;

impl NodeHasher for MptHasher {
    fn empty_hash(&self) -> H256 {
        *EMPTY_TRIE_HASH
    }

    fn hash_node(&self, forest: &ForestInner, id: NodeId) -> Result<H256, StoreError> {
        if id.is_empty() {
            return Ok(self.empty_hash());
        }
        if !forest.is_hash_dirty(id) {
            return Ok(forest.stored_hash(id));
        }
        let rlp = self.encode_node(forest, id)?;
        let hash = keccak(&rlp);
        forest.store_hash(id, hash);
        forest.clear_hash_dirty(id);
        Ok(hash)
    }

    fn encode_node(&self, forest: &ForestInner, id: NodeId) -> Result<Vec<u8>, StoreError> {
        let snapshot = forest.node(id)?.read().clone();
        match snapshot {
            Node::Branch(branch) => {
                let mut refs = Vec::with_capacity(16);
                let mut embedded = 0u16;
                for (i, child) in branch.children.iter().enumerate() {
                    let cached = branch
                        .embedded_tracked
                        .then_some(branch.embedded & (1 << i) != 0);
                    let child_ref = self.child_ref(forest, *child, cached)?;
                    if child_ref.is_embedded() {
                        embedded |= 1 << i;
                    }
                    refs.push(child_ref);
                }
                if !branch.embedded_tracked || branch.embedded != embedded {
                    if let Node::Branch(branch) = &mut *forest.node(id)?.write() {
                        branch.embedded = embedded;
                        branch.embedded_tracked = true;
                    }
                }
                let mut payload = Vec::new();
                for child_ref in &refs {
                    match child_ref {
                        ChildRef::Empty => payload.push(RLP_NULL),
                        ChildRef::Embedded(rlp) => payload.extend_from_slice(rlp),
                        ChildRef::Hashed(hash) => {
                            <[u8] as RLPEncode>::encode(hash.as_bytes(), &mut payload)
                        }
                    }
                }
                // State and storage tries store no terminator values in branches.
                payload.push(RLP_NULL);
                let mut out = Vec::with_capacity(payload.len() + 4);
                encode_length(payload.len(), &mut out);
                out.extend_from_slice(&payload);
                Ok(out)
            }
            Node::Extension(ext) => {
                let child_ref = self.child_ref(forest, ext.child, ext.child_embedded)?;
                if ext.child_embedded != Some(child_ref.is_embedded()) {
                    if let Node::Extension(ext) = &mut *forest.node(id)?.write() {
                        ext.child_embedded = Some(child_ref.is_embedded());
                    }
                }
                let mut out = Vec::new();
                let encoder = Encoder::new(&mut out).encode_bytes(&ext.path.encode_compact(false));
                match &child_ref {
                    ChildRef::Embedded(rlp) => encoder.encode_raw(rlp),
                    ChildRef::Hashed(hash) => encoder.encode_bytes(hash.as_bytes()),
                    ChildRef::Empty => {
                        return Err(StoreError::InvariantViolation(format!(
                            "extension {id} with an empty child"
                        )));
                    }
                }
                .finish();
                Ok(out)
            }
            Node::Account(account) => {
                let storage_hash = self.hash_node(forest, account.storage)?;
                let code_hash = if account.info.code_hash.is_zero() {
                    *EMPTY_CODE_HASH
                } else {
                    account.info.code_hash
                };
                let mut body = Vec::new();
                Encoder::new(&mut body)
                    .encode_field(&account.info.nonce)
                    .encode_field(&account.info.balance)
                    .encode_field(&storage_hash)
                    .encode_field(&code_hash)
                    .finish();
                let suffix = leaf_suffix(
                    &node::address_path(forest.config(), &account.address),
                    account.suffix_len,
                )?;
                let mut out = Vec::new();
                Encoder::new(&mut out)
                    .encode_bytes(&suffix.encode_compact(true))
                    .encode_bytes(&body)
                    .finish();
                Ok(out)
            }
            Node::Value(value) => {
                let bytes = value.value.as_bytes();
                let stripped = &bytes[bytes.iter().take_while(|b| **b == 0).count()..];
                let mut inner = Vec::new();
                <[u8] as RLPEncode>::encode(stripped, &mut inner);
                let suffix = leaf_suffix(
                    &node::key_path(forest.config(), &value.key),
                    value.suffix_len,
                )?;
                let mut out = Vec::new();
                Encoder::new(&mut out)
                    .encode_bytes(&suffix.encode_compact(true))
                    .encode_bytes(&inner)
                    .finish();
                Ok(out)
            }
        }
    }
}

impl MptHasher {
    /// Resolves how a child appears in its parent's RLP: inlined when its own
    /// RLP is shorter than 32 bytes, referenced by Keccak hash otherwise.
    ///
    /// `cached` carries the parent's cached embedded flag, if still valid.
    fn child_ref(
        &self,
        forest: &ForestInner,
        child: NodeId,
        cached: Option<bool>,
    ) -> Result<ChildRef, StoreError> {
        if child.is_empty() {
            return Ok(ChildRef::Empty);
        }
        if !forest.is_hash_dirty(child) {
            return match cached {
                Some(true) => Ok(ChildRef::Embedded(self.encode_node(forest, child)?)),
                Some(false) => Ok(ChildRef::Hashed(forest.stored_hash(child))),
                None => {
                    let rlp = self.encode_node(forest, child)?;
                    if rlp.len() < 32 {
                        Ok(ChildRef::Embedded(rlp))
                    } else {
                        Ok(ChildRef::Hashed(forest.stored_hash(child)))
                    }
                }
            };
        }
        let rlp = self.encode_node(forest, child)?;
        let hash = keccak(&rlp);
        forest.store_hash(child, hash);
        forest.clear_hash_dirty(child);
        if rlp.len() < 32 {
            Ok(ChildRef::Embedded(rlp))
        } else {
            Ok(ChildRef::Hashed(hash))
        }
    }
}

/// The unconsumed tail of a leaf's full navigation path.
fn leaf_suffix(full: &Nibbles, suffix_len: u8) -> Result<Nibbles, StoreError> {
    let suffix_len = suffix_len as usize;
    if suffix_len > full.len() {
        return Err(StoreError::Corruption(format!(
            "leaf suffix length {suffix_len} exceeds path length {}",
            full.len()
        )));
    }
    Ok(full.shift_left(full.len() - suffix_len))
}

/// Internal-use hasher: SHA-256 over a tag byte, the node's fields and its
/// children's hashes. Not Ethereum-compatible.
pub(crate) struct DirectHasher;

impl NodeHasher for DirectHasher {
    fn empty_hash(&self) -> H256 {
        H256::zero()
    }

    fn hash_node(&self, forest: &ForestInner, id: NodeId) -> Result<H256, StoreError> {
        if id.is_empty() {
            return Ok(self.empty_hash());
        }
        if !forest.is_hash_dirty(id) {
            return Ok(forest.stored_hash(id));
        }
        let preimage = self.encode_node(forest, id)?;
        let hash = H256::from_slice(Sha256::digest(&preimage).as_slice());
        forest.store_hash(id, hash);
        forest.clear_hash_dirty(id);
        Ok(hash)
    }

    fn encode_node(&self, forest: &ForestInner, id: NodeId) -> Result<Vec<u8>, StoreError> {
        let snapshot = forest.node(id)?.read().clone();
        let mut out = Vec::new();
        match snapshot {
            Node::Branch(branch) => {
                out.push(0x01);
                for child in branch.children {
                    out.extend_from_slice(self.hash_node(forest, child)?.as_bytes());
                }
            }
            Node::Extension(ext) => {
                out.push(0x02);
                out.extend_from_slice(&ext.path.to_disk());
                out.extend_from_slice(self.hash_node(forest, ext.child)?.as_bytes());
            }
            Node::Account(account) => {
                out.push(0x03);
                out.extend_from_slice(account.address.as_bytes());
                out.extend_from_slice(&account.info.nonce.to_be_bytes());
                out.extend_from_slice(&account.info.balance.to_big_endian());
                out.extend_from_slice(account.info.code_hash.as_bytes());
                out.extend_from_slice(self.hash_node(forest, account.storage)?.as_bytes());
            }
            Node::Value(value) => {
                out.push(0x04);
                out.extend_from_slice(value.key.as_bytes());
                out.extend_from_slice(value.value.as_bytes());
            }
        }
        Ok(out)
    }
}

mod account;
mod branch;
mod extension;
mod value;

pub use account::AccountNode;
pub use branch::BranchNode;
pub use extension::ExtensionNode;
pub use value::ValueNode;

use crate::MptConfig;
use crate::cache::SharedNode;
use crate::error::StoreError;
use crate::nibbles::Nibbles;
use crate::node_id::NodeId;
use crate::types::{AccountInfo, Address, Key, Value, keccak};

/// A node of a state or storage trie.
///
/// The empty node has no representation here; it is the [`NodeId::EMPTY`]
/// identifier and never hits a pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Branch(BranchNode),
    Extension(ExtensionNode),
    Account(AccountNode),
    Value(ValueNode),
}

impl Node {
    pub fn is_frozen(&self) -> bool {
        match self {
            Node::Branch(n) => n.frozen,
            Node::Extension(n) => n.frozen,
            Node::Account(n) => n.frozen,
            Node::Value(n) => n.frozen,
        }
    }

    pub(crate) fn set_frozen(&mut self) {
        match self {
            Node::Branch(n) => n.frozen = true,
            Node::Extension(n) => n.frozen = true,
            Node::Account(n) => n.frozen = true,
            Node::Value(n) => n.frozen = true,
        }
    }
}

/// Read-only access to pooled nodes, as needed by lookups and hashing.
pub(crate) trait NodeSource {
    fn node(&self, id: NodeId) -> Result<SharedNode, StoreError>;
    fn config(&self) -> &MptConfig;
}

/// Mutating access to the node pool, as needed by the structural transforms.
///
/// `update` marks a node and its hash dirty, `invalidate_hash` only the hash.
/// `release` frees a single node; recursive release is [`release_subtree`].
pub(crate) trait NodeManager: NodeSource {
    fn create(&self, node: Node) -> Result<NodeId, StoreError>;
    fn update(&self, id: NodeId);
    fn invalidate_hash(&self, id: NodeId);
    fn release(&self, id: NodeId) -> Result<(), StoreError>;
}

/// The nibble path used to navigate to an address in the state trie.
pub(crate) fn address_path(cfg: &MptConfig, address: &Address) -> Nibbles {
    if cfg.hashed_paths {
        Nibbles::from_bytes(keccak(address.as_bytes()).as_bytes())
    } else {
        Nibbles::from_bytes(address.as_bytes())
    }
}

/// The nibble path used to navigate to a slot key in a storage trie.
pub(crate) fn key_path(cfg: &MptConfig, key: &Key) -> Nibbles {
    if cfg.hashed_paths {
        Nibbles::from_bytes(keccak(key.as_bytes()).as_bytes())
    } else {
        Nibbles::from_bytes(key.as_bytes())
    }
}

fn snapshot<S: NodeSource + ?Sized>(src: &S, id: NodeId) -> Result<Node, StoreError> {
    Ok(src.node(id)?.read().clone())
}

pub(crate) fn get_account<S: NodeSource + ?Sized>(
    src: &S,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
) -> Result<Option<AccountInfo>, StoreError> {
    if id.is_empty() {
        return Ok(None);
    }
    match snapshot(src, id)? {
        Node::Branch(node) => branch::get_account(src, &node, address, path),
        Node::Extension(node) => extension::get_account(src, &node, address, path),
        Node::Account(node) => Ok((node.address == *address).then_some(node.info)),
        Node::Value(_) => Err(StoreError::InvariantViolation(format!(
            "account lookup reached value node {id}"
        ))),
    }
}

pub(crate) fn get_slot<S: NodeSource + ?Sized>(
    src: &S,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    key: &Key,
    key_path: &Nibbles,
) -> Result<Value, StoreError> {
    if id.is_empty() {
        return Ok(Value::zero());
    }
    match snapshot(src, id)? {
        Node::Branch(node) => branch::get_slot(src, &node, address, path, key, key_path),
        Node::Extension(node) => extension::get_slot(src, &node, address, path, key, key_path),
        Node::Account(node) => {
            if node.address == *address {
                get_value(src, node.storage, key, key_path)
            } else {
                Ok(Value::zero())
            }
        }
        Node::Value(_) => Err(StoreError::InvariantViolation(format!(
            "slot lookup reached value node {id} in the state trie"
        ))),
    }
}

/// Storage-trie lookup; returns the zero value when the key is absent.
pub(crate) fn get_value<S: NodeSource + ?Sized>(
    src: &S,
    id: NodeId,
    key: &Key,
    path: &Nibbles,
) -> Result<Value, StoreError> {
    if id.is_empty() {
        return Ok(Value::zero());
    }
    match snapshot(src, id)? {
        Node::Branch(node) => branch::get_value(src, &node, key, path),
        Node::Extension(node) => extension::get_value(src, &node, key, path),
        Node::Value(node) => Ok(if node.key == *key {
            node.value
        } else {
            Value::zero()
        }),
        Node::Account(_) => Err(StoreError::InvariantViolation(format!(
            "value lookup reached account node {id} under a storage root"
        ))),
    }
}

pub(crate) fn set_account<M: NodeManager + ?Sized>(
    mgr: &M,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    info: &AccountInfo,
) -> Result<(NodeId, bool), StoreError> {
    if id.is_empty() {
        if info.is_empty() {
            return Ok((NodeId::EMPTY, false));
        }
        let node = AccountNode::new(*address, *info, path.len() as u8);
        let new_id = mgr.create(Node::Account(node))?;
        return Ok((new_id, true));
    }
    match snapshot(mgr, id)? {
        Node::Branch(node) => branch::set_account(mgr, node, id, address, path, info),
        Node::Extension(node) => extension::set_account(mgr, node, id, address, path, info),
        Node::Account(node) => account::set_account(mgr, node, id, address, path, info),
        Node::Value(_) => Err(StoreError::InvariantViolation(format!(
            "account update reached value node {id}"
        ))),
    }
}

pub(crate) fn set_slot<M: NodeManager + ?Sized>(
    mgr: &M,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    key: &Key,
    key_path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    if id.is_empty() {
        // Slot writes never implicitly create an account.
        return Ok((NodeId::EMPTY, false));
    }
    match snapshot(mgr, id)? {
        Node::Branch(node) => branch::set_slot(mgr, node, id, address, path, key, key_path, value),
        Node::Extension(node) => {
            extension::set_slot(mgr, node, id, address, path, key, key_path, value)
        }
        Node::Account(node) => account::set_slot(mgr, node, id, address, key, key_path, value),
        Node::Value(_) => Err(StoreError::InvariantViolation(format!(
            "slot update reached value node {id} in the state trie"
        ))),
    }
}

/// Storage-trie update; writing the zero value deletes the slot.
pub(crate) fn set_value<M: NodeManager + ?Sized>(
    mgr: &M,
    id: NodeId,
    key: &Key,
    path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    if id.is_empty() {
        if value.is_zero() {
            return Ok((NodeId::EMPTY, false));
        }
        let node = ValueNode::new(*key, *value, path.len() as u8);
        let new_id = mgr.create(Node::Value(node))?;
        return Ok((new_id, true));
    }
    match snapshot(mgr, id)? {
        Node::Branch(node) => branch::set_value(mgr, node, id, key, path, value),
        Node::Extension(node) => extension::set_value(mgr, node, id, key, path, value),
        Node::Value(node) => value::set_value(mgr, node, id, key, path, value),
        Node::Account(_) => Err(StoreError::InvariantViolation(format!(
            "value update reached account node {id} under a storage root"
        ))),
    }
}

pub(crate) fn clear_storage<M: NodeManager + ?Sized>(
    mgr: &M,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
) -> Result<(NodeId, bool), StoreError> {
    if id.is_empty() {
        return Ok((NodeId::EMPTY, false));
    }
    match snapshot(mgr, id)? {
        Node::Branch(node) => branch::clear_storage(mgr, node, id, address, path),
        Node::Extension(node) => extension::clear_storage(mgr, node, id, address, path),
        Node::Account(node) => account::clear_storage(mgr, node, id, address),
        Node::Value(_) => Err(StoreError::InvariantViolation(format!(
            "storage clear reached value node {id} in the state trie"
        ))),
    }
}

/// Recursively releases a non-frozen subtree, children first.
/// Frozen nodes stay: they are shared with archived roots.
pub(crate) fn release_subtree<M: NodeManager + ?Sized>(
    mgr: &M,
    id: NodeId,
) -> Result<(), StoreError> {
    if id.is_empty() {
        return Ok(());
    }
    let node = snapshot(mgr, id)?;
    if node.is_frozen() {
        return Ok(());
    }
    match &node {
        Node::Branch(n) => {
            for child in n.children {
                release_subtree(mgr, child)?;
            }
        }
        Node::Extension(n) => release_subtree(mgr, n.child)?,
        Node::Account(n) => release_subtree(mgr, n.storage)?,
        Node::Value(_) => {}
    }
    mgr.release(id)
}

/// Marks `id` and everything reachable from it as frozen.
pub(crate) fn freeze<M: NodeManager + ?Sized>(mgr: &M, id: NodeId) -> Result<(), StoreError> {
    if id.is_empty() {
        return Ok(());
    }
    let shared = mgr.node(id)?;
    let node = shared.read().clone();
    if node.is_frozen() {
        // Everything below a frozen node is frozen already.
        return Ok(());
    }
    match &node {
        Node::Branch(n) => {
            for child in n.children {
                freeze(mgr, child)?;
            }
        }
        Node::Extension(n) => freeze(mgr, n.child)?,
        Node::Account(n) => freeze(mgr, n.storage)?,
        Node::Value(_) => {}
    }
    shared.write().set_frozen();
    Ok(())
}

/// Validates the structural invariants of the subtree rooted at `id`.
///
/// `prefix` is the path consumed so far from the trie root; `in_storage`
/// selects which leaf kind is legal.
pub(crate) fn check<S: NodeSource + ?Sized>(
    src: &S,
    id: NodeId,
    prefix: &Nibbles,
    in_storage: bool,
) -> Result<(), StoreError> {
    if id.is_empty() {
        return Ok(());
    }
    let cfg = src.config();
    match snapshot(src, id)? {
        Node::Branch(node) => {
            if node.child_count() < 2 {
                return Err(StoreError::InvariantViolation(format!(
                    "branch {id} has {} children",
                    node.child_count()
                )));
            }
            for (nibble, child) in node.children.iter().enumerate() {
                if child.is_empty() {
                    continue;
                }
                let mut child_prefix = *prefix;
                child_prefix.append(nibble as u8);
                check(src, *child, &child_prefix, in_storage)?;
            }
            Ok(())
        }
        Node::Extension(node) => {
            if node.path.is_empty() {
                return Err(StoreError::InvariantViolation(format!(
                    "extension {id} has an empty path"
                )));
            }
            if !node.child.is_branch() {
                return Err(StoreError::InvariantViolation(format!(
                    "extension {id} points at non-branch {}",
                    node.child
                )));
            }
            let mut child_prefix = *prefix;
            child_prefix.append_all(&node.path);
            check(src, node.child, &child_prefix, in_storage)
        }
        Node::Account(node) => {
            if in_storage {
                return Err(StoreError::InvariantViolation(format!(
                    "account node {id} under a storage root"
                )));
            }
            let full = address_path(cfg, &node.address);
            if !prefix.is_prefix_of(&full) {
                return Err(StoreError::InvariantViolation(format!(
                    "account {id} unreachable at its position"
                )));
            }
            if cfg.track_suffix_len && node.suffix_len as usize != full.len() - prefix.len() {
                return Err(StoreError::InvariantViolation(format!(
                    "account {id} stores suffix length {}, expected {}",
                    node.suffix_len,
                    full.len() - prefix.len()
                )));
            }
            check(src, node.storage, &Nibbles::default(), true)
        }
        Node::Value(node) => {
            if !in_storage {
                return Err(StoreError::InvariantViolation(format!(
                    "value node {id} in the state trie"
                )));
            }
            if node.value.is_zero() {
                return Err(StoreError::InvariantViolation(format!(
                    "value node {id} stores the zero value"
                )));
            }
            let full = key_path(cfg, &node.key);
            if !prefix.is_prefix_of(&full) {
                return Err(StoreError::InvariantViolation(format!(
                    "value {id} unreachable at its position"
                )));
            }
            if cfg.track_suffix_len && node.suffix_len as usize != full.len() - prefix.len() {
                return Err(StoreError::InvariantViolation(format!(
                    "value {id} stores suffix length {}, expected {}",
                    node.suffix_len,
                    full.len() - prefix.len()
                )));
            }
            Ok(())
        }
    }
}

/// Builds the subtree produced by splitting two leaves that share a common
/// prefix: an optional extension over the prefix on top of a branch holding
/// both leaves at their distinguishing nibbles.
pub(crate) fn join_leaves<M: NodeManager + ?Sized>(
    mgr: &M,
    prefix: &Nibbles,
    a: (u8, NodeId),
    b: (u8, NodeId),
) -> Result<NodeId, StoreError> {
    debug_assert_ne!(a.0, b.0);
    let mut children = [NodeId::EMPTY; 16];
    children[a.0 as usize] = a.1;
    children[b.0 as usize] = b.1;
    let branch_id = mgr.create(Node::Branch(BranchNode::new(children)))?;
    if prefix.is_empty() {
        return Ok(branch_id);
    }
    mgr.create(Node::Extension(ExtensionNode::new(*prefix, branch_id)))
}

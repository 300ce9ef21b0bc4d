use super::{Node, NodeManager};
use crate::error::StoreError;
use crate::node_id::NodeId;
use crate::nibbles::Nibbles;
use crate::types::{AccountInfo, Address, Key, Value};

/// State-trie leaf holding an account and the root of its storage trie.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountNode {
    pub address: Address,
    pub info: AccountInfo,
    pub storage: NodeId,
    pub frozen: bool,
    /// Nibbles of the (hashed) address still unconsumed at this depth.
    pub suffix_len: u8,
}

impl AccountNode {
    pub fn new(address: Address, info: AccountInfo, suffix_len: u8) -> Self {
        Self {
            address,
            info,
            storage: NodeId::EMPTY,
            frozen: false,
            suffix_len,
        }
    }
}

pub(super) fn set_account<M: NodeManager + ?Sized>(
    mgr: &M,
    node: AccountNode,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    info: &AccountInfo,
) -> Result<(NodeId, bool), StoreError> {
    if node.address == *address {
        if node.info == *info {
            return Ok((id, false));
        }
        if info.is_empty() {
            // Deleting the account drops its whole storage trie.
            super::release_subtree(mgr, node.storage)?;
            if !node.frozen {
                mgr.release(id)?;
            }
            return Ok((NodeId::EMPTY, true));
        }
        if node.frozen {
            let mut clone = node;
            clone.frozen = false;
            clone.info = *info;
            return Ok((mgr.create(Node::Account(clone))?, true));
        }
        if let Node::Account(account) = &mut *mgr.node(id)?.write() {
            account.info = *info;
        }
        mgr.update(id);
        return Ok((id, true));
    }
    if info.is_empty() {
        return Ok((id, false));
    }
    split_with_sibling(mgr, node, id, path, address, info)
}

pub(super) fn set_slot<M: NodeManager + ?Sized>(
    mgr: &M,
    node: AccountNode,
    id: NodeId,
    address: &Address,
    key: &Key,
    key_path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    if node.address != *address {
        return Ok((id, false));
    }
    let (new_storage, changed) = super::set_value(mgr, node.storage, key, key_path, value)?;
    if !changed {
        return Ok((id, false));
    }
    if new_storage == node.storage {
        // Storage subtree modified in place; the account's stored root id is
        // unchanged but its hash went stale.
        mgr.invalidate_hash(id);
        return Ok((id, true));
    }
    if node.frozen {
        let mut clone = node;
        clone.frozen = false;
        clone.storage = new_storage;
        return Ok((mgr.create(Node::Account(clone))?, true));
    }
    if let Node::Account(account) = &mut *mgr.node(id)?.write() {
        account.storage = new_storage;
    }
    mgr.update(id);
    Ok((id, true))
}

pub(super) fn clear_storage<M: NodeManager + ?Sized>(
    mgr: &M,
    node: AccountNode,
    id: NodeId,
    address: &Address,
) -> Result<(NodeId, bool), StoreError> {
    if node.address != *address || node.storage.is_empty() {
        return Ok((id, false));
    }
    super::release_subtree(mgr, node.storage)?;
    if node.frozen {
        let mut clone = node;
        clone.frozen = false;
        clone.storage = NodeId::EMPTY;
        return Ok((mgr.create(Node::Account(clone))?, true));
    }
    if let Node::Account(account) = &mut *mgr.node(id)?.write() {
        account.storage = NodeId::EMPTY;
    }
    mgr.update(id);
    Ok((id, true))
}

/// Turns this leaf into a two-leaf subtree when a second account lands on a
/// path sharing a prefix with it.
fn split_with_sibling<M: NodeManager + ?Sized>(
    mgr: &M,
    node: AccountNode,
    id: NodeId,
    path: &Nibbles,
    address: &Address,
    info: &AccountInfo,
) -> Result<(NodeId, bool), StoreError> {
    let full = super::address_path(mgr.config(), &node.address);
    let own_path = full.shift_left(full.len() - path.len());
    let common = own_path.common_prefix_len(path);
    if common >= path.len() {
        return Err(StoreError::Corruption(format!(
            "distinct addresses {} and {} share a full navigation path",
            node.address, address
        )));
    }
    let new_suffix = (path.len() - common - 1) as u8;
    let own_id = if mgr.config().track_suffix_len && node.suffix_len != new_suffix {
        if node.frozen {
            let mut clone = node;
            clone.frozen = false;
            clone.suffix_len = new_suffix;
            mgr.create(Node::Account(clone))?
        } else {
            if let Node::Account(account) = &mut *mgr.node(id)?.write() {
                account.suffix_len = new_suffix;
            }
            mgr.update(id);
            id
        }
    } else {
        id
    };
    let sibling = mgr.create(Node::Account(AccountNode::new(
        *address, *info, new_suffix,
    )))?;
    let top = super::join_leaves(
        mgr,
        &path.slice(0, common),
        (own_path.get(common), own_id),
        (path.get(common), sibling),
    )?;
    Ok((top, true))
}

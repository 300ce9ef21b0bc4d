use super::{Node, NodeManager};
use crate::error::StoreError;
use crate::nibbles::Nibbles;
use crate::node_id::NodeId;
use crate::types::{Key, Value};

/// Storage-trie leaf holding one slot. Never stores the zero value; writing
/// zero deletes the node instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueNode {
    pub key: Key,
    pub value: Value,
    pub frozen: bool,
    /// Nibbles of the (hashed) key still unconsumed at this depth.
    pub suffix_len: u8,
}

impl ValueNode {
    pub fn new(key: Key, value: Value, suffix_len: u8) -> Self {
        Self {
            key,
            value,
            frozen: false,
            suffix_len,
        }
    }
}

pub(super) fn set_value<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ValueNode,
    id: NodeId,
    key: &Key,
    path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    if node.key == *key {
        if node.value == *value {
            return Ok((id, false));
        }
        if value.is_zero() {
            if !node.frozen {
                mgr.release(id)?;
            }
            return Ok((NodeId::EMPTY, true));
        }
        if node.frozen {
            let mut clone = node;
            clone.frozen = false;
            clone.value = *value;
            return Ok((mgr.create(Node::Value(clone))?, true));
        }
        if let Node::Value(leaf) = &mut *mgr.node(id)?.write() {
            leaf.value = *value;
        }
        mgr.update(id);
        return Ok((id, true));
    }
    if value.is_zero() {
        return Ok((id, false));
    }
    split_with_sibling(mgr, node, id, path, key, value)
}

fn split_with_sibling<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ValueNode,
    id: NodeId,
    path: &Nibbles,
    key: &Key,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    let full = super::key_path(mgr.config(), &node.key);
    let own_path = full.shift_left(full.len() - path.len());
    let common = own_path.common_prefix_len(path);
    if common >= path.len() {
        return Err(StoreError::Corruption(format!(
            "distinct keys {} and {} share a full navigation path",
            node.key, key
        )));
    }
    let new_suffix = (path.len() - common - 1) as u8;
    let own_id = if mgr.config().track_suffix_len && node.suffix_len != new_suffix {
        if node.frozen {
            let mut clone = node;
            clone.frozen = false;
            clone.suffix_len = new_suffix;
            mgr.create(Node::Value(clone))?
        } else {
            if let Node::Value(leaf) = &mut *mgr.node(id)?.write() {
                leaf.suffix_len = new_suffix;
            }
            mgr.update(id);
            id
        }
    } else {
        id
    };
    let sibling = mgr.create(Node::Value(ValueNode::new(*key, *value, new_suffix)))?;
    let top = super::join_leaves(
        mgr,
        &path.slice(0, common),
        (own_path.get(common), own_id),
        (path.get(common), sibling),
    )?;
    Ok((top, true))
}

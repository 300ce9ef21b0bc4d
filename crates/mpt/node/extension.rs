use super::{Node, NodeManager, NodeSource};
use crate::error::StoreError;
use crate::nibbles::Nibbles;
use crate::node_id::NodeId;
use crate::types::{AccountInfo, Address, Key, Value};

/// A run of nibbles shared by every key below it.
///
/// The path is never empty and the child is always a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionNode {
    pub path: Nibbles,
    pub child: NodeId,
    pub frozen: bool,
    /// Cached embedded flag of the child's RLP; `None` until the hasher
    /// computes it.
    pub child_embedded: Option<bool>,
}

impl ExtensionNode {
    pub fn new(path: Nibbles, child: NodeId) -> Self {
        Self {
            path,
            child,
            frozen: false,
            child_embedded: None,
        }
    }
}

pub(super) fn get_account<S: NodeSource + ?Sized>(
    src: &S,
    node: &ExtensionNode,
    address: &Address,
    path: &Nibbles,
) -> Result<Option<AccountInfo>, StoreError> {
    if !node.path.is_prefix_of(path) {
        return Ok(None);
    }
    super::get_account(src, node.child, address, &path.shift_left(node.path.len()))
}

pub(super) fn get_slot<S: NodeSource + ?Sized>(
    src: &S,
    node: &ExtensionNode,
    address: &Address,
    path: &Nibbles,
    key: &Key,
    key_path: &Nibbles,
) -> Result<Value, StoreError> {
    if !node.path.is_prefix_of(path) {
        return Ok(Value::zero());
    }
    super::get_slot(
        src,
        node.child,
        address,
        &path.shift_left(node.path.len()),
        key,
        key_path,
    )
}

pub(super) fn get_value<S: NodeSource + ?Sized>(
    src: &S,
    node: &ExtensionNode,
    key: &Key,
    path: &Nibbles,
) -> Result<Value, StoreError> {
    if !node.path.is_prefix_of(path) {
        return Ok(Value::zero());
    }
    super::get_value(src, node.child, key, &path.shift_left(node.path.len()))
}

pub(super) fn set_account<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ExtensionNode,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    info: &AccountInfo,
) -> Result<(NodeId, bool), StoreError> {
    if node.path.is_prefix_of(path) {
        let outcome = super::set_account(
            mgr,
            node.child,
            address,
            &path.shift_left(node.path.len()),
            info,
        )?;
        return apply_child_update(mgr, node, id, outcome);
    }
    if info.is_empty() {
        // Nothing under the diverging path to delete.
        return Ok((id, false));
    }
    let address = *address;
    let info = *info;
    split_for_leaf(mgr, node, id, path, move |mgr, leaf_path| {
        mgr.create(Node::Account(super::AccountNode::new(
            address,
            info,
            leaf_path.len() as u8,
        )))
    })
}

#[allow(clippy::too_many_arguments)]
pub(super) fn set_slot<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ExtensionNode,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    key: &Key,
    key_path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    if !node.path.is_prefix_of(path) {
        return Ok((id, false));
    }
    let outcome = super::set_slot(
        mgr,
        node.child,
        address,
        &path.shift_left(node.path.len()),
        key,
        key_path,
        value,
    )?;
    apply_child_update(mgr, node, id, outcome)
}

pub(super) fn set_value<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ExtensionNode,
    id: NodeId,
    key: &Key,
    path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    if node.path.is_prefix_of(path) {
        let outcome =
            super::set_value(mgr, node.child, key, &path.shift_left(node.path.len()), value)?;
        return apply_child_update(mgr, node, id, outcome);
    }
    if value.is_zero() {
        return Ok((id, false));
    }
    let key = *key;
    let value = *value;
    split_for_leaf(mgr, node, id, path, move |mgr, leaf_path| {
        mgr.create(Node::Value(super::ValueNode::new(
            key,
            value,
            leaf_path.len() as u8,
        )))
    })
}

pub(super) fn clear_storage<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ExtensionNode,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
) -> Result<(NodeId, bool), StoreError> {
    if !node.path.is_prefix_of(path) {
        return Ok((id, false));
    }
    let outcome =
        super::clear_storage(mgr, node.child, address, &path.shift_left(node.path.len()))?;
    apply_child_update(mgr, node, id, outcome)
}

/// Folds a child update back into the extension: fuses child extensions,
/// absorbs the path into surviving leaves, and disappears when the child does.
fn apply_child_update<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ExtensionNode,
    id: NodeId,
    outcome: (NodeId, bool),
) -> Result<(NodeId, bool), StoreError> {
    let (new_child, changed) = outcome;
    if !changed {
        return Ok((id, false));
    }
    if new_child == node.child {
        if let Node::Extension(ext) = &mut *mgr.node(id)?.write() {
            ext.child_embedded = None;
        }
        mgr.invalidate_hash(id);
        return Ok((id, true));
    }
    if new_child.is_empty() {
        if !node.frozen {
            mgr.release(id)?;
        }
        return Ok((NodeId::EMPTY, true));
    }
    if new_child.is_branch() {
        if node.frozen {
            let new_id = mgr.create(Node::Extension(ExtensionNode::new(node.path, new_child)))?;
            return Ok((new_id, true));
        }
        if let Node::Extension(ext) = &mut *mgr.node(id)?.write() {
            ext.child = new_child;
            ext.child_embedded = None;
        }
        mgr.update(id);
        return Ok((id, true));
    }
    if new_child.is_extension() {
        return fuse(mgr, node, id, new_child);
    }
    // The child collapsed into a leaf; the leaf takes over this position and
    // its stored suffix grows by the extension's path.
    if mgr.config().track_suffix_len {
        let shared = mgr.node(new_child)?;
        match &mut *shared.write() {
            Node::Account(account) => account.suffix_len += node.path.len() as u8,
            Node::Value(value) => value.suffix_len += node.path.len() as u8,
            _ => {}
        }
        mgr.update(new_child);
    }
    if !node.frozen {
        mgr.release(id)?;
    }
    Ok((new_child, true))
}

/// Appends the child extension's path to ours and adopts its child.
fn fuse<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ExtensionNode,
    id: NodeId,
    child_id: NodeId,
) -> Result<(NodeId, bool), StoreError> {
    let child = match &*mgr.node(child_id)?.read() {
        Node::Extension(ext) => ext.clone(),
        other => {
            return Err(StoreError::Corruption(format!(
                "expected extension at {child_id}, found {other:?}"
            )));
        }
    };
    let mut fused = node.path;
    fused.append_all(&child.path);
    let result = if node.frozen {
        let new_id = mgr.create(Node::Extension(ExtensionNode::new(fused, child.child)))?;
        Ok((new_id, true))
    } else {
        if let Node::Extension(ext) = &mut *mgr.node(id)?.write() {
            ext.path = fused;
            ext.child = child.child;
            ext.child_embedded = None;
        }
        mgr.update(id);
        Ok((id, true))
    };
    if !child.frozen {
        mgr.release(child_id)?;
    }
    result
}

/// Splits the extension at the point where `path` diverges from it, producing
/// (optional shorter extension) -> branch -> {original child side, new leaf}.
fn split_for_leaf<M: NodeManager + ?Sized>(
    mgr: &M,
    node: ExtensionNode,
    id: NodeId,
    path: &Nibbles,
    make_leaf: impl FnOnce(&M, Nibbles) -> Result<NodeId, StoreError>,
) -> Result<(NodeId, bool), StoreError> {
    let common = node.path.common_prefix_len(path);
    debug_assert!(common < node.path.len());
    if common >= path.len() {
        return Err(StoreError::Corruption(
            "navigation path ends inside an extension".into(),
        ));
    }
    let leaf = make_leaf(mgr, path.shift_left(common + 1))?;
    let tail_len = node.path.len() - common - 1;
    let original_side = if tail_len == 0 {
        node.child
    } else {
        mgr.create(Node::Extension(ExtensionNode::new(
            node.path.slice(common + 1, node.path.len()),
            node.child,
        )))?
    };
    let mut children = [NodeId::EMPTY; 16];
    children[node.path.get(common) as usize] = original_side;
    children[path.get(common) as usize] = leaf;
    let branch = mgr.create(Node::Branch(super::BranchNode::new(children)))?;
    if common == 0 {
        if !node.frozen {
            mgr.release(id)?;
        }
        return Ok((branch, true));
    }
    if node.frozen {
        let new_id = mgr.create(Node::Extension(ExtensionNode::new(
            node.path.slice(0, common),
            branch,
        )))?;
        return Ok((new_id, true));
    }
    if let Node::Extension(ext) = &mut *mgr.node(id)?.write() {
        ext.path = node.path.slice(0, common);
        ext.child = branch;
        ext.child_embedded = None;
    }
    mgr.update(id);
    Ok((id, true))
}

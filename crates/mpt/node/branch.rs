use super::{Node, NodeManager, NodeSource};
use crate::error::StoreError;
use crate::nibbles::Nibbles;
use crate::node_id::NodeId;
use crate::types::{AccountInfo, Address, Key, Value};

/// A 16-way fork of the trie.
///
/// Always has at least two non-empty children; removals that would leave a
/// single child collapse the node into its survivor.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchNode {
    pub children: [NodeId; 16],
    pub frozen: bool,
    /// Cached bitmap of children whose RLP is inlined in this node's encoding.
    /// Only meaningful while `embedded_tracked` holds; recomputed after a reload.
    pub embedded: u16,
    pub embedded_tracked: bool,
}

impl BranchNode {
    pub fn new(children: [NodeId; 16]) -> Self {
        Self {
            children,
            frozen: false,
            embedded: 0,
            embedded_tracked: false,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    /// The only non-empty child, if there is exactly one.
    pub fn single_child(&self) -> Option<(u8, NodeId)> {
        let mut found = None;
        for (nibble, child) in self.children.iter().enumerate() {
            if !child.is_empty() {
                if found.is_some() {
                    return None;
                }
                found = Some((nibble as u8, *child));
            }
        }
        found
    }
}

fn route(path: &Nibbles) -> Result<(u8, Nibbles), StoreError> {
    let nibble = path
        .first()
        .ok_or_else(|| StoreError::Corruption("navigation path exhausted at a branch".into()))?;
    Ok((nibble, path.shift_left(1)))
}

pub(super) fn get_account<S: NodeSource + ?Sized>(
    src: &S,
    node: &BranchNode,
    address: &Address,
    path: &Nibbles,
) -> Result<Option<AccountInfo>, StoreError> {
    let (nibble, rest) = route(path)?;
    super::get_account(src, node.children[nibble as usize], address, &rest)
}

pub(super) fn get_slot<S: NodeSource + ?Sized>(
    src: &S,
    node: &BranchNode,
    address: &Address,
    path: &Nibbles,
    key: &Key,
    key_path: &Nibbles,
) -> Result<Value, StoreError> {
    let (nibble, rest) = route(path)?;
    super::get_slot(src, node.children[nibble as usize], address, &rest, key, key_path)
}

pub(super) fn get_value<S: NodeSource + ?Sized>(
    src: &S,
    node: &BranchNode,
    key: &Key,
    path: &Nibbles,
) -> Result<Value, StoreError> {
    let (nibble, rest) = route(path)?;
    super::get_value(src, node.children[nibble as usize], key, &rest)
}

pub(super) fn set_account<M: NodeManager + ?Sized>(
    mgr: &M,
    node: BranchNode,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    info: &AccountInfo,
) -> Result<(NodeId, bool), StoreError> {
    let (nibble, rest) = route(path)?;
    let outcome = super::set_account(mgr, node.children[nibble as usize], address, &rest, info)?;
    apply_child_update(mgr, node, id, nibble, outcome)
}

#[allow(clippy::too_many_arguments)]
pub(super) fn set_slot<M: NodeManager + ?Sized>(
    mgr: &M,
    node: BranchNode,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
    key: &Key,
    key_path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    let (nibble, rest) = route(path)?;
    let outcome = super::set_slot(
        mgr,
        node.children[nibble as usize],
        address,
        &rest,
        key,
        key_path,
        value,
    )?;
    apply_child_update(mgr, node, id, nibble, outcome)
}

pub(super) fn set_value<M: NodeManager + ?Sized>(
    mgr: &M,
    node: BranchNode,
    id: NodeId,
    key: &Key,
    path: &Nibbles,
    value: &Value,
) -> Result<(NodeId, bool), StoreError> {
    let (nibble, rest) = route(path)?;
    let outcome = super::set_value(mgr, node.children[nibble as usize], key, &rest, value)?;
    apply_child_update(mgr, node, id, nibble, outcome)
}

pub(super) fn clear_storage<M: NodeManager + ?Sized>(
    mgr: &M,
    node: BranchNode,
    id: NodeId,
    address: &Address,
    path: &Nibbles,
) -> Result<(NodeId, bool), StoreError> {
    let (nibble, rest) = route(path)?;
    let outcome = super::clear_storage(mgr, node.children[nibble as usize], address, &rest)?;
    apply_child_update(mgr, node, id, nibble, outcome)
}

/// Folds the outcome of a child update back into this branch: overwrites the
/// child slot, collapses the branch when a removal leaves a single child, and
/// clones first when the branch is frozen.
fn apply_child_update<M: NodeManager + ?Sized>(
    mgr: &M,
    node: BranchNode,
    id: NodeId,
    nibble: u8,
    outcome: (NodeId, bool),
) -> Result<(NodeId, bool), StoreError> {
    let child = node.children[nibble as usize];
    let (new_child, changed) = outcome;
    if !changed {
        return Ok((id, false));
    }
    if new_child == child {
        // Child modified in place; only this node's hash went stale.
        if let Node::Branch(branch) = &mut *mgr.node(id)?.write() {
            branch.embedded_tracked = false;
        }
        mgr.invalidate_hash(id);
        return Ok((id, true));
    }
    if new_child.is_empty() {
        return remove_child(mgr, node, id, nibble);
    }
    if node.frozen {
        let mut clone = BranchNode::new(node.children);
        clone.children[nibble as usize] = new_child;
        return Ok((mgr.create(Node::Branch(clone))?, true));
    }
    if let Node::Branch(branch) = &mut *mgr.node(id)?.write() {
        branch.children[nibble as usize] = new_child;
        branch.embedded_tracked = false;
    }
    mgr.update(id);
    Ok((id, true))
}

fn remove_child<M: NodeManager + ?Sized>(
    mgr: &M,
    node: BranchNode,
    id: NodeId,
    nibble: u8,
) -> Result<(NodeId, bool), StoreError> {
    let mut children = node.children;
    children[nibble as usize] = NodeId::EMPTY;
    let remaining = BranchNode::new(children);
    match remaining.single_child() {
        None => {
            // Still at least two children, stay a branch.
            if node.frozen {
                Ok((mgr.create(Node::Branch(remaining))?, true))
            } else {
                if let Node::Branch(branch) = &mut *mgr.node(id)?.write() {
                    branch.children[nibble as usize] = NodeId::EMPTY;
                    branch.embedded_tracked = false;
                }
                mgr.update(id);
                Ok((id, true))
            }
        }
        Some((survivor_nibble, survivor)) => {
            let collapsed = collapse_into_survivor(mgr, survivor_nibble, survivor)?;
            if !node.frozen {
                mgr.release(id)?;
            }
            Ok((collapsed, true))
        }
    }
}

/// Replaces a one-child branch by its survivor, accounting for the nibble the
/// branch used to consume.
fn collapse_into_survivor<M: NodeManager + ?Sized>(
    mgr: &M,
    nibble: u8,
    survivor: NodeId,
) -> Result<NodeId, StoreError> {
    let shared = mgr.node(survivor)?;
    let node = shared.read().clone();
    match node {
        Node::Branch(_) => mgr.create(Node::Extension(super::ExtensionNode::new(
            Nibbles::single(nibble),
            survivor,
        ))),
        Node::Extension(ext) => {
            if ext.frozen {
                let mut path = ext.path;
                path.prepend(nibble);
                mgr.create(Node::Extension(super::ExtensionNode::new(path, ext.child)))
            } else {
                if let Node::Extension(ext) = &mut *shared.write() {
                    ext.path.prepend(nibble);
                }
                mgr.update(survivor);
                Ok(survivor)
            }
        }
        Node::Account(account) => {
            if !mgr.config().track_suffix_len {
                return Ok(survivor);
            }
            if account.frozen {
                let mut clone = account;
                clone.frozen = false;
                clone.suffix_len += 1;
                mgr.create(Node::Account(clone))
            } else {
                if let Node::Account(account) = &mut *shared.write() {
                    account.suffix_len += 1;
                }
                mgr.update(survivor);
                Ok(survivor)
            }
        }
        Node::Value(value) => {
            if !mgr.config().track_suffix_len {
                return Ok(survivor);
            }
            if value.frozen {
                let mut clone = value;
                clone.frozen = false;
                clone.suffix_len += 1;
                mgr.create(Node::Value(clone))
            } else {
                if let Node::Value(value) = &mut *shared.write() {
                    value.suffix_len += 1;
                }
                mgr.update(survivor);
                Ok(survivor)
            }
        }
    }
}

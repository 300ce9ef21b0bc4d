use crate::error::StoreError;

const KIND_SHIFT: u32 = 61;
const INDEX_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// The kind of node a [`NodeId`] refers to, which selects its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Empty = 0,
    Branch = 1,
    Extension = 2,
    Account = 3,
    Value = 4,
}

/// Tagged identifier of a pooled node.
///
/// The top three bits carry the node kind, the remaining 61 bits the index
/// within that kind's pool. The all-zero encoding is the empty node.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const EMPTY: NodeId = NodeId(0);

    pub fn new(kind: NodeKind, index: u64) -> Self {
        debug_assert!(index <= INDEX_MASK);
        match kind {
            NodeKind::Empty => Self::EMPTY,
            kind => NodeId(((kind as u64) << KIND_SHIFT) | index),
        }
    }

    pub fn branch(index: u64) -> Self {
        Self::new(NodeKind::Branch, index)
    }

    pub fn extension(index: u64) -> Self {
        Self::new(NodeKind::Extension, index)
    }

    pub fn account(index: u64) -> Self {
        Self::new(NodeKind::Account, index)
    }

    pub fn value(index: u64) -> Self {
        Self::new(NodeKind::Value, index)
    }

    pub fn kind(&self) -> NodeKind {
        match self.0 >> KIND_SHIFT {
            0 => NodeKind::Empty,
            1 => NodeKind::Branch,
            2 => NodeKind::Extension,
            3 => NodeKind::Account,
            _ => NodeKind::Value,
        }
    }

    pub fn index(&self) -> u64 {
        self.0 & INDEX_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_branch(&self) -> bool {
        self.kind() == NodeKind::Branch
    }

    pub fn is_extension(&self) -> bool {
        self.kind() == NodeKind::Extension
    }

    pub fn is_account(&self) -> bool {
        self.kind() == NodeKind::Account
    }

    pub fn is_value(&self) -> bool {
        self.kind() == NodeKind::Value
    }

    /// Fixed-width little-endian disk image.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Result<Self, StoreError> {
        let raw = u64::from_le_bytes(bytes);
        let tag = raw >> KIND_SHIFT;
        if tag > NodeKind::Value as u64 {
            return Err(StoreError::Corruption(format!(
                "invalid node id tag {tag}"
            )));
        }
        if tag == 0 && raw != 0 {
            return Err(StoreError::Corruption(
                "empty node id with nonzero index".into(),
            ));
        }
        Ok(NodeId(raw))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            NodeKind::Empty => write!(f, "E"),
            NodeKind::Branch => write!(f, "B{}", self.index()),
            NodeKind::Extension => write!(f, "X{}", self.index()),
            NodeKind::Account => write!(f, "A{}", self.index()),
            NodeKind::Value => write!(f, "V{}", self.index()),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_is_the_zero_value() {
        assert_eq!(NodeId::default(), NodeId::EMPTY);
        assert!(NodeId::EMPTY.is_empty());
        assert_eq!(NodeId::EMPTY.to_bytes(), [0u8; 8]);
    }

    #[test]
    fn kinds_and_indices_roundtrip() {
        let cases = [
            (NodeId::branch(0), NodeKind::Branch, 0),
            (NodeId::extension(17), NodeKind::Extension, 17),
            (NodeId::account(u64::MAX >> 3), NodeKind::Account, u64::MAX >> 3),
            (NodeId::value(42), NodeKind::Value, 42),
        ];
        for (id, kind, index) in cases {
            assert_eq!(id.kind(), kind);
            assert_eq!(id.index(), index);
            assert_eq!(NodeId::from_bytes(id.to_bytes()).expect("valid"), id);
        }
    }

    #[test]
    fn branch_zero_does_not_alias_empty() {
        assert!(!NodeId::branch(0).is_empty());
        assert_ne!(NodeId::branch(0), NodeId::EMPTY);
    }

    #[test]
    fn from_bytes_rejects_bad_tags() {
        assert!(NodeId::from_bytes((5u64 << 61).to_le_bytes()).is_err());
        assert!(NodeId::from_bytes(1u64.to_le_bytes()).is_err());
    }
}

use std::collections::BTreeMap;

use arbor_rlp::constants::RLP_NULL;
use arbor_rlp::decode::decode_bytes;
use arbor_rlp::structs::Decoder;
use ethereum_types::{H256, U256};

use crate::error::StoreError;
use crate::forest::Forest;
use crate::nibbles::Nibbles;
use crate::node::{Node, NodeSource};
use crate::node_id::NodeId;
use crate::types::{Address, Balance, Hash, Key, Nonce, Value, keccak};
use crate::{EMPTY_TRIE_HASH, HasherKind};

/// A self-contained set of RLP-encoded trie nodes addressed by their Keccak
/// hash, sufficient to answer queries about selected accounts and slots under
/// a known state root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WitnessProof {
    nodes: BTreeMap<Hash, Vec<u8>>,
}

/// Outcome of navigating a proof along one path.
enum Lookup {
    /// Terminated at a leaf whose suffix matched; carries the leaf's value.
    Value(Vec<u8>),
    /// Terminated definitively without finding the path.
    Absent,
    /// A referenced node is missing from the proof.
    Incomplete,
}

/// An account body as stored in a state-trie leaf.
struct AccountBody {
    nonce: Nonce,
    balance: Balance,
    storage_root: Hash,
    code_hash: Hash,
}

impl AccountBody {
    fn decode(rlp: &[u8]) -> Result<Self, StoreError> {
        let decoder = Decoder::new(rlp)?;
        let (nonce, decoder) = decoder.decode_field::<u64>("nonce")?;
        let (balance, decoder) = decoder.decode_field::<U256>("balance")?;
        let (storage_root, decoder) = decoder.decode_field::<H256>("storage_root")?;
        let (code_hash, decoder) = decoder.decode_field::<H256>("code_hash")?;
        decoder.finish()?;
        Ok(Self {
            nonce,
            balance,
            storage_root,
            code_hash,
        })
    }
}

/// Decoded form of a proof node, used only for navigation.
enum ProofNode {
    Empty,
    Branch { children: Box<[ProofChild; 16]> },
    Extension { path: Nibbles, child: ProofChild },
    Leaf { path: Nibbles, value: Vec<u8> },
}

enum ProofChild {
    Empty,
    Hash(Hash),
    Embedded(Box<ProofNode>),
}

impl ProofNode {
    fn decode(rlp: &[u8]) -> Result<Self, StoreError> {
        if rlp == [RLP_NULL] {
            return Ok(ProofNode::Empty);
        }
        let mut items = Vec::new();
        let mut decoder = Decoder::new(rlp)?;
        while !decoder.is_done() {
            let item;
            (item, decoder) = decoder.get_encoded_item()?;
            items.push(item);
            if items.len() > 17 {
                return Err(StoreError::Corruption(
                    "proof node with more than 17 items".into(),
                ));
            }
        }
        match items.len() {
            2 => {
                let (compact, _) = decode_bytes(&items[0])?;
                let (path, is_leaf) = Nibbles::decode_compact(compact)?;
                if is_leaf {
                    let (value, _) = decode_bytes(&items[1])?;
                    Ok(ProofNode::Leaf {
                        path,
                        value: value.to_vec(),
                    })
                } else {
                    Ok(ProofNode::Extension {
                        path,
                        child: ProofChild::decode(&items[1])?,
                    })
                }
            }
            17 => {
                let mut children = Vec::with_capacity(16);
                for item in &items[..16] {
                    children.push(ProofChild::decode(item)?);
                }
                let children: Box<[ProofChild; 16]> = children
                    .try_into()
                    .map_err(|_| StoreError::Corruption("branch item count".into()))?;
                Ok(ProofNode::Branch { children })
            }
            n => Err(StoreError::Corruption(format!(
                "proof node with {n} items, expected 2 or 17"
            ))),
        }
    }
}

impl ProofChild {
    fn decode(item: &[u8]) -> Result<Self, StoreError> {
        let first = *item
            .first()
            .ok_or_else(|| StoreError::Corruption("empty proof child".into()))?;
        if first >= 0xc0 {
            // A sub-32-byte child is inlined as a list.
            return Ok(ProofChild::Embedded(Box::new(ProofNode::decode(item)?)));
        }
        let (bytes, rest) = decode_bytes(item)?;
        if !rest.is_empty() {
            return Err(StoreError::Corruption("trailing bytes in proof child".into()));
        }
        match bytes.len() {
            0 => Ok(ProofChild::Empty),
            32 => Ok(ProofChild::Hash(Hash::from_slice(bytes))),
            n => Err(StoreError::Corruption(format!(
                "proof child hash of {n} bytes"
            ))),
        }
    }
}

impl WitnessProof {
    /// Extracts a proof for `address` and the given slot keys from the trie
    /// at `root`, bringing all reachable dirty hashes up to date first.
    pub fn create(
        forest: &Forest,
        root: NodeId,
        address: &Address,
        keys: &[Key],
    ) -> Result<Self, StoreError> {
        if forest.hasher_kind() != HasherKind::Mpt {
            return Err(StoreError::UnsupportedConfiguration(
                "witness proofs require the Ethereum hasher".into(),
            ));
        }
        forest.get_hash_for(root)?;
        let mut nodes = BTreeMap::new();
        // The empty node is in every proof, so navigation through empty roots
        // and subtrees always terminates definitively.
        nodes.insert(*EMPTY_TRIE_HASH, vec![RLP_NULL]);
        if root.is_empty() {
            return Ok(Self { nodes });
        }
        let inner = forest.inner();
        let mut current = root;
        let mut path = Nibbles::from_bytes(keccak(address.as_bytes()).as_bytes());
        loop {
            let rlp = forest.encode_node(current)?;
            nodes.insert(keccak(&rlp), rlp);
            let node = inner.node(current)?.read().clone();
            match node {
                Node::Branch(branch) => {
                    let nibble = path.first().ok_or_else(|| {
                        StoreError::Corruption("address path exhausted at a branch".into())
                    })?;
                    let child = branch.children[nibble as usize];
                    if child.is_empty() {
                        break;
                    }
                    current = child;
                    path = path.shift_left(1);
                }
                Node::Extension(ext) => {
                    if !ext.path.is_prefix_of(&path) {
                        break;
                    }
                    current = ext.child;
                    path = path.shift_left(ext.path.len());
                }
                Node::Account(account) => {
                    if account.address == *address {
                        for key in keys {
                            Self::collect_storage(forest, account.storage, key, &mut nodes)?;
                        }
                    }
                    break;
                }
                Node::Value(_) => {
                    return Err(StoreError::InvariantViolation(format!(
                        "value node {current} in the state trie"
                    )));
                }
            }
        }
        Ok(Self { nodes })
    }

    fn collect_storage(
        forest: &Forest,
        root: NodeId,
        key: &Key,
        nodes: &mut BTreeMap<Hash, Vec<u8>>,
    ) -> Result<(), StoreError> {
        if root.is_empty() {
            nodes.insert(*EMPTY_TRIE_HASH, vec![RLP_NULL]);
            return Ok(());
        }
        let inner = forest.inner();
        let mut current = root;
        let mut path = Nibbles::from_bytes(keccak(key.as_bytes()).as_bytes());
        loop {
            let rlp = forest.encode_node(current)?;
            nodes.insert(keccak(&rlp), rlp);
            let node = inner.node(current)?.read().clone();
            match node {
                Node::Branch(branch) => {
                    let nibble = path.first().ok_or_else(|| {
                        StoreError::Corruption("key path exhausted at a branch".into())
                    })?;
                    let child = branch.children[nibble as usize];
                    if child.is_empty() {
                        break;
                    }
                    current = child;
                    path = path.shift_left(1);
                }
                Node::Extension(ext) => {
                    if !ext.path.is_prefix_of(&path) {
                        break;
                    }
                    current = ext.child;
                    path = path.shift_left(ext.path.len());
                }
                Node::Value(_) => break,
                Node::Account(_) => {
                    return Err(StoreError::InvariantViolation(format!(
                        "account node {current} under a storage root"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reassembles a proof from raw `(hash, rlp)` entries, e.g. received from
    /// a peer. Entries are taken as-is; run [`WitnessProof::is_valid`] before
    /// trusting the result.
    pub fn from_entries(entries: impl IntoIterator<Item = (Hash, Vec<u8>)>) -> Self {
        Self {
            nodes: entries.into_iter().collect(),
        }
    }

    /// The stored `(hash, rlp)` entries in hash order.
    pub fn entries(&self) -> impl Iterator<Item = (&Hash, &Vec<u8>)> {
        self.nodes.iter()
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Unions another proof into this one.
    pub fn merge(&mut self, other: &WitnessProof) {
        for (hash, rlp) in &other.nodes {
            self.nodes.insert(*hash, rlp.clone());
        }
    }

    /// True iff every entry hashes to its key and decodes to a valid node.
    pub fn is_valid(&self) -> bool {
        self.nodes
            .iter()
            .all(|(hash, rlp)| keccak(rlp) == *hash && ProofNode::decode(rlp).is_ok())
    }

    /// Re-navigates the proof for `address` and `keys`, copying every
    /// traversed entry into a sub-proof. The flag reports whether every
    /// navigation terminated definitively.
    pub fn extract(
        &self,
        root: Hash,
        address: &Address,
        keys: &[Key],
    ) -> Result<(WitnessProof, bool), StoreError> {
        let mut sub = WitnessProof::default();
        let path = Nibbles::from_bytes(keccak(address.as_bytes()).as_bytes());
        let account = self.walk(root, path, Some(&mut sub.nodes))?;
        let mut complete = !matches!(account, Lookup::Incomplete);
        if let Lookup::Value(body) = account {
            let body = AccountBody::decode(&body)?;
            for key in keys {
                let key_path = Nibbles::from_bytes(keccak(key.as_bytes()).as_bytes());
                let slot = self.walk(body.storage_root, key_path, Some(&mut sub.nodes))?;
                complete &= !matches!(slot, Lookup::Incomplete);
            }
        }
        Ok((sub, complete))
    }

    /// Balance of `address` under `root`; the flag is false when the proof
    /// cannot answer definitively.
    pub fn get_balance(&self, root: Hash, address: &Address) -> Result<(Balance, bool), StoreError> {
        Ok(match self.account(root, address)? {
            Lookup::Value(body) => (AccountBody::decode(&body)?.balance, true),
            Lookup::Absent => (Balance::zero(), true),
            Lookup::Incomplete => (Balance::zero(), false),
        })
    }

    pub fn get_nonce(&self, root: Hash, address: &Address) -> Result<(Nonce, bool), StoreError> {
        Ok(match self.account(root, address)? {
            Lookup::Value(body) => (AccountBody::decode(&body)?.nonce, true),
            Lookup::Absent => (0, true),
            Lookup::Incomplete => (0, false),
        })
    }

    pub fn get_code_hash(&self, root: Hash, address: &Address) -> Result<(Hash, bool), StoreError> {
        Ok(match self.account(root, address)? {
            Lookup::Value(body) => (AccountBody::decode(&body)?.code_hash, true),
            Lookup::Absent => (Hash::zero(), true),
            Lookup::Incomplete => (Hash::zero(), false),
        })
    }

    /// Value of a storage slot under `root`. A navigation ending at an empty
    /// or diverging node yields the zero value with the definitive flag set.
    pub fn get_state(
        &self,
        root: Hash,
        address: &Address,
        key: &Key,
    ) -> Result<(Value, bool), StoreError> {
        let body = match self.account(root, address)? {
            Lookup::Value(body) => AccountBody::decode(&body)?,
            Lookup::Absent => return Ok((Value::zero(), true)),
            Lookup::Incomplete => return Ok((Value::zero(), false)),
        };
        let key_path = Nibbles::from_bytes(keccak(key.as_bytes()).as_bytes());
        Ok(match self.walk(body.storage_root, key_path, None)? {
            Lookup::Value(rlp) => {
                let (stripped, _) = decode_bytes(&rlp)?;
                if stripped.len() > 32 {
                    return Err(StoreError::Corruption("oversized slot value".into()));
                }
                let mut bytes = [0u8; 32];
                bytes[32 - stripped.len()..].copy_from_slice(stripped);
                (Value::from(bytes), true)
            }
            Lookup::Absent => (Value::zero(), true),
            Lookup::Incomplete => (Value::zero(), false),
        })
    }

    /// Whether every slot of `address` whose navigation path falls within
    /// `[from, to]` is zero. Bounds are in path space: with hashed paths they
    /// bound the hashed keys. Returns `None` when the proof cannot tell.
    pub fn all_states_zero(
        &self,
        root: Hash,
        address: &Address,
        from: &Key,
        to: &Key,
    ) -> Result<Option<bool>, StoreError> {
        let body = match self.account(root, address)? {
            Lookup::Value(body) => AccountBody::decode(&body)?,
            Lookup::Absent => return Ok(Some(true)),
            Lookup::Incomplete => return Ok(None),
        };
        let from = Nibbles::from_bytes(from.as_bytes());
        let to = Nibbles::from_bytes(to.as_bytes());
        self.range_empty_at(body.storage_root, Nibbles::default(), &from, &to)
    }

    /// Whether every account whose navigation path falls within `[from, to]`
    /// is absent. Bounds are in path space (hashed-address space for hashed
    /// tries). Returns `None` when the proof cannot tell.
    pub fn all_addresses_empty(
        &self,
        root: Hash,
        from: &Hash,
        to: &Hash,
    ) -> Result<Option<bool>, StoreError> {
        let from = Nibbles::from_bytes(from.as_bytes());
        let to = Nibbles::from_bytes(to.as_bytes());
        self.range_empty_at(root, Nibbles::default(), &from, &to)
    }

    fn account(&self, root: Hash, address: &Address) -> Result<Lookup, StoreError> {
        let path = Nibbles::from_bytes(keccak(address.as_bytes()).as_bytes());
        self.walk(root, path, None)
    }

    /// The §4.12 navigation state machine: follows `path` from the node with
    /// hash `root`, resolving embedded children inline and hashed children
    /// through the proof map.
    fn walk(
        &self,
        root: Hash,
        mut path: Nibbles,
        mut touched: Option<&mut BTreeMap<Hash, Vec<u8>>>,
    ) -> Result<Lookup, StoreError> {
        let Some(rlp) = self.nodes.get(&root) else {
            return Ok(Lookup::Incomplete);
        };
        if let Some(touched) = touched.as_mut() {
            touched.insert(root, rlp.clone());
        }
        let mut node = ProofNode::decode(rlp)?;
        loop {
            let child = match node {
                ProofNode::Empty => return Ok(Lookup::Absent),
                ProofNode::Leaf {
                    path: suffix,
                    value,
                } => {
                    return Ok(if suffix == path {
                        Lookup::Value(value)
                    } else {
                        Lookup::Absent
                    });
                }
                ProofNode::Branch { children } => {
                    let Some(nibble) = path.first() else {
                        return Ok(Lookup::Absent);
                    };
                    path = path.shift_left(1);
                    let mut children = children;
                    std::mem::replace(&mut children[nibble as usize], ProofChild::Empty)
                }
                ProofNode::Extension {
                    path: prefix,
                    child,
                } => {
                    if !prefix.is_prefix_of(&path) {
                        return Ok(Lookup::Absent);
                    }
                    path = path.shift_left(prefix.len());
                    child
                }
            };
            node = match child {
                ProofChild::Empty => return Ok(Lookup::Absent),
                ProofChild::Embedded(embedded) => *embedded,
                ProofChild::Hash(hash) => {
                    let Some(rlp) = self.nodes.get(&hash) else {
                        return Ok(Lookup::Incomplete);
                    };
                    if let Some(touched) = touched.as_mut() {
                        touched.insert(hash, rlp.clone());
                    }
                    ProofNode::decode(rlp)?
                }
            };
        }
    }

    /// Range walk with pruning. `consumed` is the path from the trie root to
    /// the current node; subtrees entirely outside `[from, to]` are skipped
    /// without requiring their nodes.
    fn range_empty_at(
        &self,
        root: Hash,
        consumed: Nibbles,
        from: &Nibbles,
        to: &Nibbles,
    ) -> Result<Option<bool>, StoreError> {
        if prefix_outside(&consumed, from, to) {
            return Ok(Some(true));
        }
        let Some(rlp) = self.nodes.get(&root) else {
            return Ok(None);
        };
        self.range_empty_node(&ProofNode::decode(rlp)?, consumed, from, to)
    }

    fn range_empty_node(
        &self,
        node: &ProofNode,
        consumed: Nibbles,
        from: &Nibbles,
        to: &Nibbles,
    ) -> Result<Option<bool>, StoreError> {
        if prefix_outside(&consumed, from, to) {
            return Ok(Some(true));
        }
        match node {
            ProofNode::Empty => Ok(Some(true)),
            ProofNode::Leaf { path, .. } => {
                let mut full = consumed;
                full.append_all(path);
                Ok(Some(prefix_outside(&full, from, to)))
            }
            ProofNode::Extension { path, child } => {
                let mut extended = consumed;
                extended.append_all(path);
                self.range_empty_child(child, extended, from, to)
            }
            ProofNode::Branch { children } => {
                let mut verdict = Some(true);
                for (nibble, child) in children.iter().enumerate() {
                    let mut extended = consumed;
                    extended.append(nibble as u8);
                    match self.range_empty_child(child, extended, from, to)? {
                        Some(true) => {}
                        Some(false) => return Ok(Some(false)),
                        None => verdict = None,
                    }
                }
                Ok(verdict)
            }
        }
    }

    fn range_empty_child(
        &self,
        child: &ProofChild,
        consumed: Nibbles,
        from: &Nibbles,
        to: &Nibbles,
    ) -> Result<Option<bool>, StoreError> {
        match child {
            ProofChild::Empty => Ok(Some(true)),
            ProofChild::Embedded(node) => self.range_empty_node(node, consumed, from, to),
            ProofChild::Hash(hash) => self.range_empty_at(*hash, consumed, from, to),
        }
    }
}

/// True when no key starting with `prefix` can lie within `[from, to]`.
fn prefix_outside(prefix: &Nibbles, from: &Nibbles, to: &Nibbles) -> bool {
    let len = prefix.len().min(from.len());
    for i in 0..len {
        match prefix.get(i).cmp(&from.get(i)) {
            std::cmp::Ordering::Less => {
                // Largest key under this prefix is below the lower bound.
                return true;
            }
            std::cmp::Ordering::Greater => break,
            std::cmp::Ordering::Equal => {}
        }
    }
    let len = prefix.len().min(to.len());
    for i in 0..len {
        match prefix.get(i).cmp(&to.get(i)) {
            std::cmp::Ordering::Greater => {
                // Smallest key under this prefix is above the upper bound.
                return true;
            }
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => {}
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_bounds() {
        let from = Nibbles::from_nibbles(&[2, 0]);
        let to = Nibbles::from_nibbles(&[4, 0xf]);
        assert!(prefix_outside(&Nibbles::from_nibbles(&[1]), &from, &to));
        assert!(!prefix_outside(&Nibbles::from_nibbles(&[2]), &from, &to));
        assert!(!prefix_outside(&Nibbles::from_nibbles(&[3]), &from, &to));
        assert!(!prefix_outside(&Nibbles::from_nibbles(&[4]), &from, &to));
        assert!(prefix_outside(&Nibbles::from_nibbles(&[5]), &from, &to));
        assert!(prefix_outside(&Nibbles::from_nibbles(&[1, 0xf]), &from, &to));
        assert!(!prefix_outside(&Nibbles::from_nibbles(&[2, 0]), &from, &to));
        assert!(!prefix_outside(&Nibbles::default(), &from, &to));
    }

    #[test]
    fn proof_node_decodes_the_empty_node() {
        assert!(matches!(
            ProofNode::decode(&[RLP_NULL]).expect("valid"),
            ProofNode::Empty
        ));
    }
}

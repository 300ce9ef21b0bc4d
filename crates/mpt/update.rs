use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::forest::Forest;
use crate::node_id::NodeId;
use crate::types::{Address, Balance, Hash, Key, Nonce, Value, keccak};

/// The state difference of one block.
///
/// Applied in a fixed category order: deletes, creates, balances, nonces,
/// codes, then slots. Within a category, duplicate keys keep the last entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub created_accounts: Vec<Address>,
    pub deleted_accounts: Vec<Address>,
    pub balances: Vec<(Address, Balance)>,
    pub nonces: Vec<(Address, Nonce)>,
    pub codes: Vec<(Address, Vec<u8>)>,
    pub slots: Vec<(Address, Key, Value)>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.created_accounts.is_empty()
            && self.deleted_accounts.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.slots.is_empty()
    }

    pub fn delete_account(&mut self, address: Address) -> &mut Self {
        self.deleted_accounts.push(address);
        self
    }

    pub fn create_account(&mut self, address: Address) -> &mut Self {
        self.created_accounts.push(address);
        self
    }

    pub fn set_balance(&mut self, address: Address, balance: Balance) -> &mut Self {
        self.balances.push((address, balance));
        self
    }

    pub fn set_nonce(&mut self, address: Address, nonce: Nonce) -> &mut Self {
        self.nonces.push((address, nonce));
        self
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> &mut Self {
        self.codes.push((address, code));
        self
    }

    pub fn set_slot(&mut self, address: Address, key: Key, value: Value) -> &mut Self {
        self.slots.push((address, key, value));
        self
    }

    /// Establishes the deterministic processing order: deduplicates each
    /// category keeping the last entry per key, then sorts by key.
    pub fn normalize(&mut self) {
        dedup_last(&mut self.created_accounts, |address| *address);
        self.created_accounts.sort_unstable();
        dedup_last(&mut self.deleted_accounts, |address| *address);
        self.deleted_accounts.sort_unstable();
        dedup_last(&mut self.balances, |(address, _)| *address);
        self.balances.sort_unstable_by_key(|(address, _)| *address);
        dedup_last(&mut self.nonces, |(address, _)| *address);
        self.nonces.sort_unstable_by_key(|(address, _)| *address);
        dedup_last(&mut self.codes, |(address, _)| *address);
        self.codes.sort_by_key(|(address, _)| *address);
        dedup_last(&mut self.slots, |(address, key, _)| (*address, *key));
        self.slots
            .sort_unstable_by_key(|(address, key, _)| (*address, *key));
    }

    /// Applies the normalized update to the trie at `root`.
    ///
    /// Returns the new root plus the code blobs this update introduced, for
    /// the caller's code store. Account creation follows Ethereum semantics:
    /// an existing account keeps its balance, nonce and code, but its storage
    /// is cleared; a fresh account only materializes once a non-empty field
    /// is written.
    pub(crate) fn apply(
        &self,
        forest: &Forest,
        mut root: NodeId,
    ) -> Result<(NodeId, Vec<(Hash, Vec<u8>)>), StoreError> {
        for address in &self.deleted_accounts {
            root = forest.set_account_info(root, address, &Default::default())?;
        }
        for address in &self.created_accounts {
            root = forest.clear_storage(root, address)?;
        }
        for (address, balance) in &self.balances {
            let (mut info, _) = forest.get_account_info(root, address)?;
            info.balance = *balance;
            root = forest.set_account_info(root, address, &info)?;
        }
        for (address, nonce) in &self.nonces {
            let (mut info, _) = forest.get_account_info(root, address)?;
            info.nonce = *nonce;
            root = forest.set_account_info(root, address, &info)?;
        }
        let mut blobs = Vec::with_capacity(self.codes.len());
        for (address, code) in &self.codes {
            let code_hash = keccak(code);
            let (mut info, _) = forest.get_account_info(root, address)?;
            info.code_hash = code_hash;
            root = forest.set_account_info(root, address, &info)?;
            blobs.push((code_hash, code.clone()));
        }
        for (address, key, value) in &self.slots {
            root = forest.set_value(root, address, key, value)?;
        }
        Ok((root, blobs))
    }
}

fn dedup_last<T, K: std::hash::Hash + Eq>(entries: &mut Vec<T>, key: impl Fn(&T) -> K) {
    let mut seen: FxHashMap<K, usize> = FxHashMap::default();
    for (i, entry) in entries.iter().enumerate() {
        seen.insert(key(entry), i);
    }
    if seen.len() == entries.len() {
        return;
    }
    let keep: FxHashSet<usize> = seen.into_values().collect();
    let mut index = 0;
    entries.retain(|_| {
        let kept = keep.contains(&index);
        index += 1;
        kept
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use ethereum_types::U256;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn normalize_keeps_the_last_duplicate() {
        let mut update = Update::default();
        update
            .set_balance(addr(1), U256::from(10))
            .set_balance(addr(2), U256::from(20))
            .set_balance(addr(1), U256::from(30));
        update.normalize();
        assert_eq!(
            update.balances,
            vec![(addr(1), U256::from(30)), (addr(2), U256::from(20))]
        );
    }

    #[test]
    fn normalize_dedups_slots_per_address_key_pair() {
        let key = |b: u8| Key::repeat_byte(b);
        let mut update = Update::default();
        update
            .set_slot(addr(1), key(1), Value::repeat_byte(0xaa))
            .set_slot(addr(1), key(2), Value::repeat_byte(0xbb))
            .set_slot(addr(1), key(1), Value::repeat_byte(0xcc));
        update.normalize();
        assert_eq!(
            update.slots,
            vec![
                (addr(1), key(1), Value::repeat_byte(0xcc)),
                (addr(1), key(2), Value::repeat_byte(0xbb)),
            ]
        );
    }

    #[test]
    fn normalize_sorts_addresses() {
        let mut update = Update::default();
        update.delete_account(addr(9)).delete_account(addr(1));
        update.normalize();
        assert_eq!(update.deleted_accounts, vec![addr(1), addr(9)]);
    }

    #[test]
    fn empty_update_reports_empty() {
        assert!(Update::default().is_empty());
        let mut update = Update::default();
        update.set_nonce(addr(1), 1);
        assert!(!update.is_empty());
    }
}

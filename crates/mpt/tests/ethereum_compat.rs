//! Root-hash comparisons against cita_trie, an independent Merkle Patricia
//! Trie implementation, emulating Ethereum's secure state and storage tries.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_mpt::types::{EMPTY_CODE_HASH, keccak};
use arbor_mpt::{AccountInfo, Address, Key, LiveTrie, MptConfig, Value};
use arbor_rlp::encode::RLPEncode;
use arbor_rlp::structs::Encoder;
use cita_trie::{MemoryDB as CitaMemoryDB, PatriciaTrie as CitaTrie, Trie as CitaTrieTrait};
use ethereum_types::{H256, U256};
use hasher::HasherKeccak;
use hex_literal::hex;
use proptest::prelude::*;

fn cita_trie() -> CitaTrie<CitaMemoryDB, HasherKeccak> {
    let memdb = Arc::new(CitaMemoryDB::new(true));
    let hasher = Arc::new(HasherKeccak::new());
    CitaTrie::new(Arc::clone(&memdb), Arc::clone(&hasher))
}

#[derive(Clone, Debug, Default, PartialEq)]
struct RefAccount {
    nonce: u64,
    balance: U256,
    storage: BTreeMap<Key, Value>,
}

/// Computes the expected Ethereum state root for the given accounts with
/// cita_trie doing all trie hashing.
fn reference_root(accounts: &BTreeMap<Address, RefAccount>) -> H256 {
    let mut state = cita_trie();
    for (address, account) in accounts {
        let storage_root = if account.storage.is_empty() {
            H256(hex!(
                "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
            ))
        } else {
            let mut storage = cita_trie();
            for (key, value) in &account.storage {
                let bytes = value.as_bytes();
                let stripped = &bytes[bytes.iter().take_while(|b| **b == 0).count()..];
                let mut rlp_value = Vec::new();
                <[u8] as RLPEncode>::encode(stripped, &mut rlp_value);
                storage
                    .insert(keccak(key.as_bytes()).as_bytes().to_vec(), rlp_value)
                    .expect("storage insert");
            }
            H256::from_slice(&storage.root().expect("storage root"))
        };
        let mut body = Vec::new();
        Encoder::new(&mut body)
            .encode_field(&account.nonce)
            .encode_field(&account.balance)
            .encode_field(&storage_root)
            .encode_field(&*EMPTY_CODE_HASH)
            .finish();
        state
            .insert(keccak(address.as_bytes()).as_bytes().to_vec(), body)
            .expect("state insert");
    }
    H256::from_slice(&state.root().expect("state root"))
}

/// Builds the same state in a live trie and returns its root hash.
fn live_root(accounts: &BTreeMap<Address, RefAccount>) -> H256 {
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    for (address, account) in accounts {
        let info = AccountInfo {
            nonce: account.nonce,
            balance: account.balance,
            code_hash: *EMPTY_CODE_HASH,
        };
        trie.set_account_info(address, &info).expect("set account");
        for (key, value) in &account.storage {
            trie.set_value(address, key, value).expect("set slot");
        }
    }
    trie.check().expect("structural invariants");
    trie.get_hash().expect("hash")
}

fn account(nonce: u64, balance: u64) -> RefAccount {
    RefAccount {
        nonce,
        balance: U256::from(balance),
        ..Default::default()
    }
}

#[test]
fn empty_trie_matches_ethereum_empty_hash() {
    let trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    assert_eq!(
        trie.get_hash().expect("hash").0,
        hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
    );
}

#[test]
fn single_account_matches_reference() {
    let mut address = Address::zero();
    address.0[0] = 0x01;
    let mut accounts = BTreeMap::new();
    accounts.insert(address, account(10, 12));
    assert_eq!(live_root(&accounts), reference_root(&accounts));
}

#[test]
fn several_accounts_match_reference() {
    let mut accounts = BTreeMap::new();
    for byte in 1..=40u8 {
        accounts.insert(Address::repeat_byte(byte), account(byte as u64, 1 << 10));
    }
    assert_eq!(live_root(&accounts), reference_root(&accounts));
}

#[test]
fn accounts_with_storage_match_reference() {
    let mut with_storage = account(1, 1000);
    for byte in 1..=20u8 {
        with_storage
            .storage
            .insert(Key::repeat_byte(byte), Value::repeat_byte(byte ^ 0x5a));
    }
    // A slot value small enough for its leaf to embed into the parent.
    let mut tiny = account(2, 2000);
    tiny.storage.insert(Key::repeat_byte(0xee), {
        let mut value = Value::zero();
        value.0[31] = 0x01;
        value
    });
    let mut accounts = BTreeMap::new();
    accounts.insert(Address::repeat_byte(0x11), with_storage);
    accounts.insert(Address::repeat_byte(0x22), tiny);
    accounts.insert(Address::repeat_byte(0x33), account(3, 3));
    assert_eq!(live_root(&accounts), reference_root(&accounts));
}

#[test]
fn deletion_converges_to_reference_of_remaining_state() {
    let addresses: Vec<Address> = (1..=12u8).map(Address::repeat_byte).collect();
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    for (i, address) in addresses.iter().enumerate() {
        let info = AccountInfo {
            nonce: i as u64 + 1,
            balance: U256::from(100),
            code_hash: *EMPTY_CODE_HASH,
        };
        trie.set_account_info(address, &info).expect("set");
    }
    // Delete every odd account; the survivors must hash as if the others
    // never existed.
    let mut expected = BTreeMap::new();
    for (i, address) in addresses.iter().enumerate() {
        if i % 2 == 1 {
            trie.set_account_info(address, &AccountInfo::default())
                .expect("delete");
        } else {
            expected.insert(*address, account(i as u64 + 1, 100));
        }
    }
    trie.check().expect("structural invariants");
    assert_eq!(trie.get_hash().expect("hash"), reference_root(&expected));
}

#[test]
fn slot_deletion_converges_to_reference() {
    let address = Address::repeat_byte(0xcd);
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    trie.set_account_info(
        &address,
        &AccountInfo {
            nonce: 7,
            balance: U256::from(9),
            code_hash: *EMPTY_CODE_HASH,
        },
    )
    .expect("set");
    for byte in 1..=10u8 {
        trie.set_value(&address, &Key::repeat_byte(byte), &Value::repeat_byte(byte))
            .expect("slot");
    }
    for byte in (1..=10u8).filter(|b| b % 3 == 0) {
        trie.set_value(&address, &Key::repeat_byte(byte), &Value::zero())
            .expect("zero out");
    }
    let mut reference = account(7, 9);
    for byte in (1..=10u8).filter(|b| b % 3 != 0) {
        reference
            .storage
            .insert(Key::repeat_byte(byte), Value::repeat_byte(byte));
    }
    let mut accounts = BTreeMap::new();
    accounts.insert(address, reference);
    trie.check().expect("structural invariants");
    assert_eq!(trie.get_hash().expect("hash"), reference_root(&accounts));
}

#[test]
fn insertion_order_does_not_change_the_root() {
    let addresses: Vec<Address> = (1..=16u8).map(Address::repeat_byte).collect();
    let build = |order: &[usize]| {
        let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
        for &i in order {
            let info = AccountInfo {
                nonce: i as u64,
                balance: U256::from(1u64) << i,
                code_hash: *EMPTY_CODE_HASH,
            };
            trie.set_account_info(&addresses[i], &info).expect("set");
        }
        trie.get_hash().expect("hash")
    };
    let forward: Vec<usize> = (0..16).collect();
    let backward: Vec<usize> = (0..16).rev().collect();
    let shuffled = vec![7, 1, 14, 3, 0, 12, 9, 5, 15, 2, 8, 11, 4, 13, 6, 10];
    let expected = build(&forward);
    assert_eq!(build(&backward), expected);
    assert_eq!(build(&shuffled), expected);
}

#[test]
fn rewriting_identical_info_is_idempotent() {
    let address = Address::repeat_byte(0x42);
    let info = AccountInfo {
        nonce: 3,
        balance: U256::from(500),
        code_hash: *EMPTY_CODE_HASH,
    };
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    trie.set_account_info(&address, &info).expect("set");
    let first = trie.get_hash().expect("hash");
    trie.set_account_info(&address, &info).expect("set again");
    assert_eq!(trie.get_hash().expect("hash"), first);
}

#[test]
fn any_modification_changes_the_root() {
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    let address = Address::repeat_byte(0x10);
    let info = AccountInfo {
        nonce: 1,
        balance: U256::from(1),
        code_hash: *EMPTY_CODE_HASH,
    };
    trie.set_account_info(&address, &info).expect("set");
    let before = trie.get_hash().expect("hash");
    trie.set_value(&address, &Key::repeat_byte(1), &Value::repeat_byte(1))
        .expect("slot");
    let after = trie.get_hash().expect("hash");
    assert_ne!(before, after);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn proptest_compare_state_roots(seeds in proptest::collection::btree_set(0u32..10_000, 1..30)) {
        let mut accounts = BTreeMap::new();
        for seed in seeds {
            let mut address = Address::zero();
            address.0[..4].copy_from_slice(&seed.to_be_bytes());
            let mut entry = account(seed as u64 % 7, (seed as u64).wrapping_mul(31) + 1);
            if seed % 3 == 0 {
                let mut key = Key::zero();
                key.0[28..].copy_from_slice(&seed.to_be_bytes());
                entry.storage.insert(key, Value::repeat_byte((seed % 255) as u8 + 1));
            }
            accounts.insert(address, entry);
        }
        prop_assert_eq!(live_root(&accounts), reference_root(&accounts));
    }

    #[test]
    fn proptest_compare_roots_with_removals(seeds in proptest::collection::btree_set(0u32..5_000, 2..24)) {
        let seeds: Vec<u32> = seeds.into_iter().collect();
        let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
        for seed in &seeds {
            let mut address = Address::zero();
            address.0[..4].copy_from_slice(&seed.to_be_bytes());
            let info = AccountInfo {
                nonce: *seed as u64,
                balance: U256::from(*seed + 1),
                code_hash: *EMPTY_CODE_HASH,
            };
            trie.set_account_info(&address, &info).expect("set");
        }
        let mut expected = BTreeMap::new();
        for seed in &seeds {
            let mut address = Address::zero();
            address.0[..4].copy_from_slice(&seed.to_be_bytes());
            if seed % 2 == 0 {
                trie.set_account_info(&address, &AccountInfo::default()).expect("delete");
            } else {
                expected.insert(address, account(*seed as u64, *seed as u64 + 1));
            }
        }
        trie.check().expect("structural invariants");
        prop_assert_eq!(trie.get_hash().expect("hash"), reference_root(&expected));
    }
}

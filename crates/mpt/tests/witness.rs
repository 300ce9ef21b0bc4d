//! Witness-proof extraction, validation and partial-state queries.

use arbor_mpt::types::EMPTY_CODE_HASH;
use arbor_mpt::{AccountInfo, Address, Key, LiveTrie, MptConfig, Value};
use ethereum_types::{H256, U256};

fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn key(byte: u8) -> Key {
    Key::repeat_byte(byte)
}

/// Two accounts, one with a storage slot; the shape behind most tests here.
fn sample_trie() -> (LiveTrie, H256) {
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    trie.set_account_info(
        &addr(1),
        &AccountInfo {
            nonce: 1,
            balance: U256::from(111),
            code_hash: *EMPTY_CODE_HASH,
        },
    )
    .expect("set");
    trie.set_account_info(
        &addr(2),
        &AccountInfo {
            nonce: 2,
            balance: U256::from(222),
            code_hash: *EMPTY_CODE_HASH,
        },
    )
    .expect("set");
    trie.set_value(&addr(1), &key(1), &Value::repeat_byte(0xb1))
        .expect("slot");
    let root = trie.get_hash().expect("hash");
    (trie, root)
}

#[test]
fn proofs_validate_and_answer_like_the_trie() {
    let (trie, root) = sample_trie();
    let proof = trie.create_witness_proof(&addr(1), &[key(1)]).expect("proof");
    assert!(proof.is_valid());

    let (balance, present) = proof.get_balance(root, &addr(1)).expect("balance");
    assert!(present);
    assert_eq!(balance, U256::from(111));

    let (nonce, present) = proof.get_nonce(root, &addr(1)).expect("nonce");
    assert!(present);
    assert_eq!(nonce, 1);

    let (code_hash, present) = proof.get_code_hash(root, &addr(1)).expect("code hash");
    assert!(present);
    assert_eq!(code_hash, *EMPTY_CODE_HASH);

    let (value, present) = proof.get_state(root, &addr(1), &key(1)).expect("state");
    assert!(present);
    assert_eq!(value, Value::repeat_byte(0xb1));
}

#[test]
fn absent_slots_are_proven_zero() {
    let (trie, root) = sample_trie();
    let proof = trie.create_witness_proof(&addr(1), &[key(1), key(9)]).expect("proof");
    // key(9) terminates at an empty or diverging node: a definitive zero.
    let (value, present) = proof.get_state(root, &addr(1), &key(9)).expect("state");
    assert!(present);
    assert_eq!(value, Value::zero());
}

#[test]
fn untraversed_accounts_are_not_answerable() {
    let (trie, root) = sample_trie();
    let proof = trie.create_witness_proof(&addr(1), &[]).expect("proof");
    // addr(2) was never traversed; its sub-structure may be missing.
    let (_, present) = proof.get_balance(root, &addr(2)).expect("balance");
    // Depending on trie shape the path may or may not be covered, but the
    // proof must never fabricate a definitive wrong answer.
    if present {
        let (balance, _) = proof.get_balance(root, &addr(2)).expect("balance");
        assert_eq!(balance, U256::from(222));
    }
}

#[test]
fn proofs_for_missing_accounts_prove_absence() {
    let (trie, root) = sample_trie();
    let proof = trie.create_witness_proof(&addr(9), &[]).expect("proof");
    assert!(proof.is_valid());
    let (balance, present) = proof.get_balance(root, &addr(9)).expect("balance");
    assert!(present);
    assert_eq!(balance, U256::zero());
}

#[test]
fn empty_trie_proofs_are_complete() {
    let trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    let root = trie.get_hash().expect("hash");
    let proof = trie.create_witness_proof(&addr(1), &[key(1)]).expect("proof");
    assert!(proof.is_valid());
    let (balance, present) = proof.get_balance(root, &addr(1)).expect("balance");
    assert!(present);
    assert_eq!(balance, U256::zero());
}

#[test]
fn extraction_is_idempotent_and_complete() {
    let (trie, root) = sample_trie();
    let proof = trie.create_witness_proof(&addr(1), &[key(1)]).expect("proof");

    let (sub, complete) = proof.extract(root, &addr(1), &[key(1)]).expect("extract");
    assert!(complete);
    assert!(sub.is_valid());

    let (sub2, complete2) = sub.extract(root, &addr(1), &[key(1)]).expect("re-extract");
    assert!(complete2);
    assert_eq!(sub, sub2);

    // The sub-proof answers the original queries.
    let (balance, present) = sub.get_balance(root, &addr(1)).expect("balance");
    assert!(present);
    assert_eq!(balance, U256::from(111));
    let (value, present) = sub.get_state(root, &addr(1), &key(1)).expect("state");
    assert!(present);
    assert_eq!(value, Value::repeat_byte(0xb1));
}

#[test]
fn merged_proofs_cover_both_queries() {
    let (trie, root) = sample_trie();
    let mut proof1 = trie.create_witness_proof(&addr(1), &[key(1)]).expect("proof 1");
    let proof2 = trie.create_witness_proof(&addr(2), &[]).expect("proof 2");
    proof1.merge(&proof2);
    assert!(proof1.is_valid());

    let (balance, present) = proof1.get_balance(root, &addr(1)).expect("balance");
    assert!(present);
    assert_eq!(balance, U256::from(111));
    let (balance, present) = proof1.get_balance(root, &addr(2)).expect("balance");
    assert!(present);
    assert_eq!(balance, U256::from(222));

    let (_, complete1) = proof1.extract(root, &addr(1), &[key(1)]).expect("extract");
    let (_, complete2) = proof1.extract(root, &addr(2), &[]).expect("extract");
    assert!(complete1);
    assert!(complete2);
}

#[test]
fn proof_answers_match_the_live_trie() {
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    for byte in 1..=25u8 {
        trie.set_account_info(
            &addr(byte),
            &AccountInfo {
                nonce: byte as u64,
                balance: U256::from(byte as u64 * 1000),
                code_hash: *EMPTY_CODE_HASH,
            },
        )
        .expect("set");
        trie.set_value(&addr(byte), &key(byte), &Value::repeat_byte(byte))
            .expect("slot");
    }
    let root = trie.get_hash().expect("hash");
    for byte in 1..=25u8 {
        let proof = trie
            .create_witness_proof(&addr(byte), &[key(byte), key(0xfe)])
            .expect("proof");
        assert!(proof.is_valid());

        let (live_info, _) = trie.get_account_info(&addr(byte)).expect("info");
        let (balance, present) = proof.get_balance(root, &addr(byte)).expect("balance");
        assert!(present);
        assert_eq!(balance, live_info.balance);
        let (nonce, present) = proof.get_nonce(root, &addr(byte)).expect("nonce");
        assert!(present);
        assert_eq!(nonce, live_info.nonce);

        let (value, present) = proof.get_state(root, &addr(byte), &key(byte)).expect("state");
        assert!(present);
        assert_eq!(value, trie.get_value(&addr(byte), &key(byte)).expect("value"));
        let (value, present) = proof
            .get_state(root, &addr(byte), &key(0xfe))
            .expect("state");
        assert!(present);
        assert_eq!(value, Value::zero());
    }
}

#[test]
fn tampered_proofs_are_invalid() {
    use arbor_mpt::WitnessProof;

    let (trie, _) = sample_trie();
    let proof = trie.create_witness_proof(&addr(1), &[key(1)]).expect("proof");
    assert!(proof.is_valid());

    // Flip a byte in the largest entry; its hash no longer matches.
    let mut entries: Vec<(H256, Vec<u8>)> = proof
        .entries()
        .map(|(hash, rlp)| (*hash, rlp.clone()))
        .collect();
    let victim = entries
        .iter_mut()
        .max_by_key(|(_, rlp)| rlp.len())
        .expect("non-empty proof");
    let last = victim.1.len() - 1;
    victim.1[last] ^= 0xff;
    let tampered = WitnessProof::from_entries(entries);
    assert!(!tampered.is_valid());

    // Re-keying an entry under a foreign hash is just as invalid.
    let (hash, rlp) = proof
        .entries()
        .next()
        .map(|(hash, rlp)| (*hash, rlp.clone()))
        .expect("entry");
    let mut wrong_key = H256::zero();
    wrong_key.0[0] = hash.0[0] ^ 0x01;
    let rekeyed = WitnessProof::from_entries([(wrong_key, rlp)]);
    assert!(!rekeyed.is_valid());
}

#[test]
fn address_range_queries() {
    let (trie, root) = sample_trie();
    // Any proof over a populated trie shows at least one account in the full
    // path range.
    let proof = trie.create_witness_proof(&addr(1), &[]).expect("proof");
    let verdict = proof
        .all_addresses_empty(root, &H256::zero(), &H256::repeat_byte(0xff))
        .expect("query");
    assert_eq!(verdict, Some(false));

    // An empty trie proves the absence of every address.
    let empty = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    let empty_root = empty.get_hash().expect("hash");
    let proof = empty.create_witness_proof(&addr(1), &[]).expect("proof");
    let verdict = proof
        .all_addresses_empty(empty_root, &H256::zero(), &H256::repeat_byte(0xff))
        .expect("query");
    assert_eq!(verdict, Some(true));
}

#[test]
fn range_queries_report_definitive_emptiness() {
    let (trie, root) = sample_trie();
    // A full proof for addr(2), which has no storage at all.
    let proof = trie.create_witness_proof(&addr(2), &[]).expect("proof");
    let verdict = proof
        .all_states_zero(root, &addr(2), &Key::zero(), &Key::repeat_byte(0xff))
        .expect("query");
    assert_eq!(verdict, Some(true));

    // addr(1) has a non-zero slot; a proof carrying its storage must see it.
    let proof = trie.create_witness_proof(&addr(1), &[key(1)]).expect("proof");
    let verdict = proof
        .all_states_zero(root, &addr(1), &Key::zero(), &Key::repeat_byte(0xff))
        .expect("query");
    assert_eq!(verdict, Some(false));
}

#[test]
fn range_queries_admit_ignorance() {
    let mut trie = LiveTrie::in_memory(MptConfig::ethereum()).expect("trie");
    trie.set_account_info(
        &addr(1),
        &AccountInfo {
            balance: U256::from(1),
            ..Default::default()
        },
    )
    .expect("set");
    for byte in 1..=10u8 {
        trie.set_value(&addr(1), &key(byte), &Value::repeat_byte(byte))
            .expect("slot");
    }
    let root = trie.get_hash().expect("hash");
    // The proof only covers the path to key(1); other storage subtrees are
    // missing, so a whole-range emptiness claim cannot be definitive.
    let proof = trie.create_witness_proof(&addr(1), &[key(1)]).expect("proof");
    let verdict = proof
        .all_states_zero(root, &addr(1), &Key::zero(), &Key::repeat_byte(0xff))
        .expect("query");
    assert_ne!(verdict, Some(true));
}

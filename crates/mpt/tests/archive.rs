//! Archive behavior: per-block roots, history reads, freezing semantics.

use arbor_mpt::types::keccak;
use arbor_mpt::{AccountInfo, Address, ArchiveTrie, Key, MptConfig, StoreError, Update, Value};
use ethereum_types::U256;
use hex_literal::hex;

fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

#[test]
fn balances_are_recorded_per_block() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");

    let mut block1 = Update::default();
    block1
        .create_account(addr(1))
        .set_balance(addr(1), U256::from(0x12));
    archive.add(1, block1).expect("block 1");

    let mut block2 = Update::default();
    block2.set_balance(addr(1), U256::from(0x34));
    archive.add(2, block2).expect("block 2");

    assert_eq!(
        archive.get_balance(1, &addr(1)).expect("read"),
        U256::from(0x12)
    );
    assert_eq!(
        archive.get_balance(2, &addr(1)).expect("read"),
        U256::from(0x34)
    );
    assert_eq!(
        archive.get_balance(0, &addr(1)).expect("read"),
        U256::zero()
    );
    assert_eq!(archive.get_last_block_height(), Some(2));
}

#[test]
fn blocks_cannot_be_rewritten() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");
    archive.add(3, Update::default()).expect("block 3");
    assert!(matches!(
        archive.add(3, Update::default()),
        Err(StoreError::BlockAlreadyArchived(3))
    ));
    assert!(matches!(
        archive.add(1, Update::default()),
        Err(StoreError::BlockAlreadyArchived(1))
    ));
    archive.add(4, Update::default()).expect("block 4");
}

#[test]
fn empty_updates_still_publish_roots() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");
    assert_eq!(archive.get_last_block_height(), None);
    let hash = archive.add(0, Update::default()).expect("block 0");
    assert_eq!(
        hash.0,
        hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
    );
    assert_eq!(archive.get_last_block_height(), Some(0));
    archive.add(1, Update::default()).expect("block 1");
    assert_eq!(archive.get_hash(1).expect("hash"), hash);
}

#[test]
fn skipped_blocks_repeat_the_previous_root() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");
    let mut block1 = Update::default();
    block1.set_balance(addr(7), U256::from(700));
    archive.add(1, block1).expect("block 1");

    let mut block5 = Update::default();
    block5.set_balance(addr(7), U256::from(705));
    archive.add(5, block5).expect("block 5");

    for block in 1..5 {
        assert_eq!(
            archive.get_balance(block, &addr(7)).expect("read"),
            U256::from(700),
            "block {block} should still see the height-1 state"
        );
    }
    assert_eq!(
        archive.get_balance(5, &addr(7)).expect("read"),
        U256::from(705)
    );
    assert_eq!(archive.get_last_block_height(), Some(5));
}

#[test]
fn history_survives_account_deletion() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");

    let mut block1 = Update::default();
    block1.set_balance(addr(1), U256::from(100));
    block1.set_balance(addr(2), U256::from(200));
    block1.set_slot(addr(1), Key::repeat_byte(1), Value::repeat_byte(0xaa));
    let root1 = archive.add(1, block1).expect("block 1");

    let mut block2 = Update::default();
    block2.delete_account(addr(1));
    archive.add(2, block2).expect("block 2");

    // The old block still reads and hashes as before the deletion.
    assert_eq!(
        archive.get_balance(1, &addr(1)).expect("read"),
        U256::from(100)
    );
    assert_eq!(
        archive
            .get_value(1, &addr(1), &Key::repeat_byte(1))
            .expect("read"),
        Value::repeat_byte(0xaa)
    );
    assert_eq!(archive.get_hash(1).expect("hash"), root1);

    let (_, present) = archive.get_account_info(2, &addr(1)).expect("read");
    assert!(!present);
    assert_eq!(
        archive.get_balance(2, &addr(2)).expect("read"),
        U256::from(200)
    );
    archive.check(1).expect("block 1 invariants");
    archive.check(2).expect("block 2 invariants");
}

#[test]
fn nonces_codes_and_slots_apply_in_order() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");
    let code = vec![0x60, 0x00, 0x60, 0x00, 0xf3];
    let code_hash = keccak(&code);

    let mut block = Update::default();
    block
        .create_account(addr(9))
        .set_balance(addr(9), U256::from(1))
        .set_nonce(addr(9), 5)
        .set_code(addr(9), code.clone())
        .set_slot(addr(9), Key::repeat_byte(2), Value::repeat_byte(0x99));
    archive.add(0, block).expect("block 0");

    let (info, present) = archive.get_account_info(0, &addr(9)).expect("read");
    assert!(present);
    assert_eq!(info.nonce, 5);
    assert_eq!(info.balance, U256::from(1));
    assert_eq!(info.code_hash, code_hash);
    assert_eq!(
        archive
            .get_value(0, &addr(9), &Key::repeat_byte(2))
            .expect("read"),
        Value::repeat_byte(0x99)
    );
    assert_eq!(archive.get_code(&code_hash), Some(code.as_slice()));
    assert_eq!(archive.get_code_hash(0, &addr(9)).expect("read"), code_hash);
}

#[test]
fn recreated_accounts_lose_their_storage() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");

    let mut block0 = Update::default();
    block0
        .set_balance(addr(4), U256::from(40))
        .set_nonce(addr(4), 4)
        .set_slot(addr(4), Key::repeat_byte(1), Value::repeat_byte(0x11));
    archive.add(0, block0).expect("block 0");

    let mut block1 = Update::default();
    block1.create_account(addr(4));
    archive.add(1, block1).expect("block 1");

    // Balance and nonce survive re-creation, the storage does not.
    let (info, present) = archive.get_account_info(1, &addr(4)).expect("read");
    assert!(present);
    assert_eq!(info.balance, U256::from(40));
    assert_eq!(info.nonce, 4);
    assert_eq!(
        archive
            .get_value(1, &addr(4), &Key::repeat_byte(1))
            .expect("read"),
        Value::zero()
    );
    // History is unaffected.
    assert_eq!(
        archive
            .get_value(0, &addr(4), &Key::repeat_byte(1))
            .expect("read"),
        Value::repeat_byte(0x11)
    );
}

#[test]
fn reads_beyond_the_head_are_rejected() {
    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");
    archive.add(0, Update::default()).expect("block 0");
    assert!(matches!(
        archive.get_balance(1, &addr(1)),
        Err(StoreError::BlockOutOfRange(1))
    ));
}

#[test]
fn archived_roots_match_a_fresh_live_build() {
    use arbor_mpt::LiveTrie;

    let mut archive = ArchiveTrie::in_memory(MptConfig::ethereum()).expect("archive");
    let mut block = Update::default();
    for byte in 1..=8u8 {
        block.set_balance(addr(byte), U256::from(byte));
        block.set_slot(addr(byte), Key::repeat_byte(byte), Value::repeat_byte(byte));
    }
    let archived = archive.add(0, block).expect("block 0");

    let mut live = LiveTrie::in_memory(MptConfig::ethereum()).expect("live");
    for byte in 1..=8u8 {
        live.set_account_info(
            &addr(byte),
            &AccountInfo {
                balance: U256::from(byte),
                ..Default::default()
            },
        )
        .expect("set");
        live.set_value(&addr(byte), &Key::repeat_byte(byte), &Value::repeat_byte(byte))
            .expect("slot");
    }
    assert_eq!(live.get_hash().expect("hash"), archived);
}

// Copyright 2020 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{StateDb, VmAccountBlock, VmDbContext};
use lattice_chain_db::Store;
use lattice_types::{Address, TokenId, U256, ADDRESS_TAG_USER};
use primitives::{AccountBlock, BlockType};
use std::sync::Arc;

fn state_db() -> Arc<StateDb> {
    Arc::new(StateDb::new(Arc::new(Store::new(
        Arc::new(kvdb_memorydb::create(1)),
        "state",
    ))))
}

fn addr(n: u8) -> Address { Address::from_id([n; 20], ADDRESS_TAG_USER) }

fn token(n: u8) -> TokenId { TokenId([n; 10]) }

fn sealed_block(n: u8) -> AccountBlock {
    let mut block = AccountBlock {
        block_type: BlockType::SendCall,
        account_address: addr(n),
        height: n as u64,
        ..Default::default()
    };
    block.seal();
    block
}

#[test]
fn balance_delta_is_invisible_until_committed() {
    let state = state_db();
    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    db.add_balance(&token(1), U256::from(100)).unwrap();
    assert_eq!(db.get_balance(&token(1)).unwrap(), U256::from(100));
    assert_eq!(
        state.get_balance(&addr(1), &token(1)).unwrap(),
        U256::zero()
    );

    let vab = VmAccountBlock { block: sealed_block(1), state: db };
    state.write_block(&vab).unwrap();
    assert_eq!(
        state.get_balance(&addr(1), &token(1)).unwrap(),
        U256::from(100)
    );
}

#[test]
fn sub_balance_checks_funds() {
    let state = state_db();
    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    db.add_balance(&token(1), U256::from(10)).unwrap();
    assert!(db.sub_balance(&token(1), U256::from(11)).is_err());
    db.sub_balance(&token(1), U256::from(4)).unwrap();
    assert_eq!(db.get_balance(&token(1)).unwrap(), U256::from(6));
}

#[test]
fn receipt_hash_covers_writes_and_balances() {
    let state = state_db();
    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    let empty = db.get_receipt_hash();

    db.set_storage(b"k".to_vec(), b"v".to_vec());
    let with_storage = db.get_receipt_hash();
    assert_ne!(empty, with_storage);

    db.add_balance(&token(1), U256::one()).unwrap();
    let with_balance = db.get_receipt_hash();
    assert_ne!(with_storage, with_balance);

    db.reset();
    assert_eq!(db.get_receipt_hash(), empty);
}

#[test]
fn insert_then_rollback_restores_state() {
    let state = state_db();

    // Committed baseline the rollback must restore.
    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    db.set_storage(b"k".to_vec(), b"old".to_vec());
    db.add_balance(&token(1), U256::from(50)).unwrap();
    let base = VmAccountBlock { block: sealed_block(1), state: db };
    state.write_block(&base).unwrap();
    state
        .insert_snapshot_block(&Default::default(), &[base.block.clone()])
        .unwrap();

    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    db.set_storage(b"k".to_vec(), b"new".to_vec());
    db.set_storage(b"fresh".to_vec(), b"x".to_vec());
    db.sub_balance(&token(1), U256::from(20)).unwrap();
    let vab = VmAccountBlock { block: sealed_block(2), state: db };
    state.write_block(&vab).unwrap();
    assert_eq!(
        state.get_storage(&addr(1), b"k").unwrap(),
        Some(b"new".to_vec())
    );

    state.rollback_account_blocks(&[vab.block.clone()]).unwrap();
    assert_eq!(
        state.get_storage(&addr(1), b"k").unwrap(),
        Some(b"old".to_vec())
    );
    assert_eq!(state.get_storage(&addr(1), b"fresh").unwrap(), None);
    assert_eq!(
        state.get_balance(&addr(1), &token(1)).unwrap(),
        U256::from(50)
    );

    // Rolling back twice must fail: the undo record is gone.
    assert!(state.rollback_account_blocks(&[vab.block]).is_err());
}

#[test]
fn storage_iterator_merges_delta() {
    let state = state_db();
    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    db.set_storage(b"p:a".to_vec(), b"1".to_vec());
    let vab = VmAccountBlock { block: sealed_block(1), state: db };
    state.write_block(&vab).unwrap();

    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    db.set_storage(b"p:b".to_vec(), b"2".to_vec());
    db.delete_storage(b"p:a".to_vec());
    db.set_storage(b"q:c".to_vec(), b"3".to_vec());

    let entries = db.new_storage_iterator(b"p:").unwrap();
    assert_eq!(entries, vec![(b"p:b".to_vec(), b"2".to_vec())]);
}

#[test]
fn cross_account_reads_see_committed_only() {
    let state = state_db();
    let mut db = state.new_vm_db(addr(1), VmDbContext::default());
    db.set_storage(b"k".to_vec(), b"v".to_vec());
    // Another account's handle must not observe the pending delta.
    let other = state.new_vm_db(addr(2), VmDbContext::default());
    assert_eq!(other.get_storage_at(&addr(1), b"k").unwrap(), None);
}

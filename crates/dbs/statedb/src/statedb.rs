// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{
    vm_db::{VmAccountBlock, VmDb, VmDbContext},
    Error, Result,
};
use lattice_chain_db::{Store, StoreBatch};
use lattice_types::{Address, Hash, TokenId, U256};
use primitives::{AccountBlock, SnapshotBlock};
use rlp::{Rlp, RlpStream};
use std::sync::Arc;

const PREFIX_BALANCE: u8 = 0x01;
const PREFIX_STORAGE: u8 = 0x02;
const PREFIX_CODE: u8 = 0x03;
const PREFIX_UNDO: u8 = 0x04;
const PREFIX_CONTRACT_META: u8 = 0x05;

pub(crate) fn balance_key(addr: &Address, token: &TokenId) -> Vec<u8> {
    let mut key = vec![PREFIX_BALANCE];
    key.extend_from_slice(addr.as_bytes());
    key.extend_from_slice(token.as_bytes());
    key
}

pub(crate) fn storage_key(addr: &Address, raw: &[u8]) -> Vec<u8> {
    let mut key = vec![PREFIX_STORAGE];
    key.extend_from_slice(addr.as_bytes());
    key.extend_from_slice(raw);
    key
}

pub(crate) fn storage_prefix(addr: &Address) -> Vec<u8> {
    let mut key = vec![PREFIX_STORAGE];
    key.extend_from_slice(addr.as_bytes());
    key
}

pub(crate) fn code_key(addr: &Address) -> Vec<u8> {
    let mut key = vec![PREFIX_CODE];
    key.extend_from_slice(addr.as_bytes());
    key
}

pub(crate) fn contract_meta_key(addr: &Address) -> Vec<u8> {
    let mut key = vec![PREFIX_CONTRACT_META];
    key.extend_from_slice(addr.as_bytes());
    key
}

fn undo_key(block_hash: &Hash) -> Vec<u8> {
    let mut key = vec![PREFIX_UNDO];
    key.extend_from_slice(block_hash.as_bytes());
    key
}

/// Committed per-contract state plus per-unconfirmed-block undo records.
/// A block's delta lands here when the chain engine accepts it; the undo
/// record is dropped once a snapshot confirms the block, and applied in
/// reverse when unconfirmed work is rolled back.
pub struct StateDb {
    store: Arc<Store>,
}

impl StateDb {
    pub fn new(store: Arc<Store>) -> Self { StateDb { store } }

    pub fn store(&self) -> &Arc<Store> { &self.store }

    pub fn new_vm_db(self: &Arc<Self>, addr: Address, ctx: VmDbContext) -> VmDb {
        VmDb::new(self.clone(), addr, ctx)
    }

    pub fn get_balance(
        &self, addr: &Address, token: &TokenId,
    ) -> Result<U256> {
        match self.store.get(&balance_key(addr, token))? {
            None => Ok(U256::zero()),
            Some(raw) => Ok(Rlp::new(&raw).as_val()?),
        }
    }

    pub fn get_storage(
        &self, addr: &Address, key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(&storage_key(addr, key))?)
    }

    /// Live `(key, value)` pairs of `addr`'s storage under `prefix`, keys
    /// relative to the account.
    pub fn iter_storage(
        &self, addr: &Address, prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut full_prefix = storage_prefix(addr);
        let base_len = full_prefix.len();
        full_prefix.extend_from_slice(prefix);
        Ok(self
            .store
            .iter_with_prefix(&full_prefix)?
            .into_iter()
            .map(|(key, value)| (key[base_len..].to_vec(), value))
            .collect())
    }

    pub fn get_code(&self, addr: &Address) -> Result<Option<(u8, Vec<u8>)>> {
        match self.store.get(&code_key(addr))? {
            None => Ok(None),
            Some(raw) => {
                let rlp = Rlp::new(&raw);
                Ok(Some((rlp.val_at(0)?, rlp.val_at(1)?)))
            }
        }
    }

    pub fn get_contract_meta(&self, addr: &Address) -> Result<Option<u8>> {
        match self.store.get(&contract_meta_key(addr))? {
            None => Ok(None),
            Some(raw) => Ok(Some(Rlp::new(&raw).as_val()?)),
        }
    }

    pub fn is_contract_account(&self, addr: &Address) -> Result<bool> {
        Ok(addr.is_contract() || self.get_code(addr)?.is_some())
    }

    /// Commits an executed block's delta. The prior value of every touched
    /// key is recorded in an undo entry keyed by the block hash, so
    /// unconfirmed work can be rolled back exactly.
    pub fn write_block(&self, vm_block: &VmAccountBlock) -> Result<()> {
        let delta = vm_block.state.delta();
        let mut batch = StoreBatch::new();
        let mut undo = RlpStream::new_list(delta.len());
        for (key, new_value) in delta {
            let old_value = self.store.get(&key)?;
            undo.begin_list(3)
                .append(&key)
                .append(&old_value.is_some())
                .append(&old_value.unwrap_or_default());
            match new_value {
                Some(value) => batch.put(key, value),
                None => batch.delete(key),
            }
        }
        batch.put(undo_key(&vm_block.block.hash), undo.out().to_vec());
        self.store.write(batch);
        trace!("state committed for block {:?}", vm_block.block.hash);
        Ok(())
    }

    /// A snapshot finalizes its confirmed blocks: their undo records are no
    /// longer reachable by rollback and are dropped.
    pub fn insert_snapshot_block(
        &self, _snapshot_block: &SnapshotBlock, confirmed: &[AccountBlock],
    ) -> Result<()> {
        let mut batch = StoreBatch::new();
        for block in confirmed {
            batch.delete(undo_key(&block.hash));
        }
        self.store.write(batch);
        Ok(())
    }

    /// Reverts the state deltas of unconfirmed blocks, newest first. Every
    /// block must still carry an undo record; a missing record means the
    /// caller tried to roll back confirmed work.
    pub fn rollback_account_blocks(
        &self, blocks: &[AccountBlock],
    ) -> Result<()> {
        let mut batch = StoreBatch::new();
        for block in blocks.iter().rev() {
            let raw = self.store.get(&undo_key(&block.hash))?.ok_or_else(
                || Error::MissingUndoRecord(format!("{:?}", block.hash)),
            )?;
            let rlp = Rlp::new(&raw);
            for entry in rlp.iter() {
                let key: Vec<u8> = entry.val_at(0)?;
                let existed: bool = entry.val_at(1)?;
                if existed {
                    batch.put(key, entry.val_at(2)?);
                } else {
                    batch.delete(key);
                }
            }
            batch.delete(undo_key(&block.hash));
        }
        self.store.write(batch);
        debug!("state rolled back {} blocks", blocks.len());
        Ok(())
    }
}

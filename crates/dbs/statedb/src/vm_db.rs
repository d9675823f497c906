// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{
    statedb::{
        balance_key, code_key, contract_meta_key, storage_key, StateDb,
    },
    Error, Result,
};
use keccak_hash::keccak;
use lattice_types::{Address, Hash, HashHeight, TokenId, U256};
use primitives::AccountBlock;
use rlp::RlpStream;
use std::{collections::BTreeMap, sync::Arc};

/// An event emitted by contract execution; committed to the block only
/// through `log_hash`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmLog {
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
}

/// Chain context frozen at the start of one execution. The chain engine (or
/// the block generator) computes these; the state database itself knows
/// nothing about chains.
#[derive(Clone, Debug, Default)]
pub struct VmDbContext {
    /// The executing account's current chain head, if any.
    pub prev_account_block: Option<HashHeight>,
    pub latest_snapshot: HashHeight,
    pub snapshot_timestamp: u64,
    /// Contract-chain depth of the send being received; zero for user sends.
    pub call_depth: u16,
    /// Unconfirmed blocks already on the executing account's chain.
    pub unconfirmed_count: u64,
}

/// Per-execution state handle. Writes land in a delta that the chain engine
/// commits on acceptance; `reset` discards the delta on VM revert.
pub struct VmDb {
    state: Arc<StateDb>,
    address: Address,
    ctx: VmDbContext,

    storage_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    balance_changes: BTreeMap<TokenId, U256>,
    code: Option<(u8, Vec<u8>)>,
    contract_meta: Option<u8>,
    logs: Vec<VmLog>,
}

impl VmDb {
    pub(crate) fn new(
        state: Arc<StateDb>, address: Address, ctx: VmDbContext,
    ) -> Self {
        VmDb {
            state,
            address,
            ctx,
            storage_writes: BTreeMap::new(),
            balance_changes: BTreeMap::new(),
            code: None,
            contract_meta: None,
            logs: Vec::new(),
        }
    }

    pub fn address(&self) -> &Address { &self.address }

    pub fn prev_account_block(&self) -> Option<HashHeight> {
        self.ctx.prev_account_block
    }

    pub fn latest_snapshot(&self) -> HashHeight { self.ctx.latest_snapshot }

    pub fn snapshot_timestamp(&self) -> u64 { self.ctx.snapshot_timestamp }

    pub fn call_depth(&self) -> u16 { self.ctx.call_depth }

    pub fn unconfirmed_count(&self) -> u64 { self.ctx.unconfirmed_count }

    pub fn get_balance(&self, token: &TokenId) -> Result<U256> {
        if let Some(balance) = self.balance_changes.get(token) {
            return Ok(*balance);
        }
        self.state.get_balance(&self.address, token)
    }

    pub fn add_balance(&mut self, token: &TokenId, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let balance = self.get_balance(token)?.saturating_add(amount);
        self.balance_changes.insert(*token, balance);
        Ok(())
    }

    pub fn sub_balance(&mut self, token: &TokenId, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let balance = self.get_balance(token)?;
        if balance < amount {
            return Err(Error::InsufficientBalance {
                available: balance.to_string(),
                needed: amount.to_string(),
            });
        }
        self.balance_changes.insert(*token, balance - amount);
        Ok(())
    }

    pub fn get_storage(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.storage_writes.get(key) {
            return Ok(staged.clone());
        }
        self.state.get_storage(&self.address, key)
    }

    /// Reads another account's committed storage. Writes are only possible
    /// against the executing account.
    pub fn get_storage_at(
        &self, addr: &Address, key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if *addr == self.address {
            return self.get_storage(key);
        }
        self.state.get_storage(addr, key)
    }

    pub fn set_storage(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.storage_writes.insert(key, Some(value));
    }

    pub fn delete_storage(&mut self, key: Vec<u8>) {
        self.storage_writes.insert(key, None);
    }

    /// Live `(key, value)` pairs under `prefix`, delta merged over committed
    /// state, in key order.
    pub fn new_storage_iterator(
        &self, prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = self
            .state
            .iter_storage(&self.address, prefix)?
            .into_iter()
            .map(|(k, v)| (k, Some(v)))
            .collect();
        for (key, staged) in &self.storage_writes {
            if key.starts_with(prefix) {
                merged.insert(key.clone(), staged.clone());
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    pub fn set_contract_code(&mut self, code_type: u8, code: Vec<u8>) {
        self.code = Some((code_type, code));
    }

    pub fn get_contract_code(
        &self, addr: &Address,
    ) -> Result<Option<(u8, Vec<u8>)>> {
        if *addr == self.address {
            if let Some(code) = &self.code {
                return Ok(Some(code.clone()));
            }
        }
        self.state.get_code(addr)
    }

    pub fn set_contract_meta(&mut self, confirm_times: u8) {
        self.contract_meta = Some(confirm_times);
    }

    pub fn is_contract_account(&self) -> Result<bool> {
        if self.code.is_some() {
            return Ok(true);
        }
        self.state.is_contract_account(&self.address)
    }

    pub fn append_log(&mut self, log: VmLog) { self.logs.push(log); }

    pub fn get_log_list_hash(&self) -> Option<Hash> {
        if self.logs.is_empty() {
            return None;
        }
        let mut s = RlpStream::new_list(self.logs.len());
        for log in &self.logs {
            s.begin_list(2);
            s.append_list(&log.topics);
            s.append(&log.data);
        }
        Some(keccak(s.out()))
    }

    /// Digest over the ordered write-set and balance changes of this
    /// execution. This is the block's authenticated state commitment.
    pub fn get_receipt_hash(&self) -> Hash {
        let mut s = RlpStream::new_list(4);
        s.begin_list(self.balance_changes.len());
        for (token, balance) in &self.balance_changes {
            s.begin_list(2).append(token).append(balance);
        }
        s.begin_list(self.storage_writes.len());
        for (key, value) in &self.storage_writes {
            s.begin_list(3)
                .append(key)
                .append(&value.is_some())
                .append(&value.clone().unwrap_or_default());
        }
        match &self.code {
            Some((code_type, code)) => {
                s.begin_list(2).append(code_type).append(code);
            }
            None => {
                s.begin_list(0);
            }
        }
        s.append(&self.contract_meta.unwrap_or_default());
        keccak(s.out())
    }

    /// Discards the pending delta. Called when the VM reverts.
    pub fn reset(&mut self) {
        self.storage_writes.clear();
        self.balance_changes.clear();
        self.code = None;
        self.contract_meta = None;
        self.logs.clear();
    }

    /// The full-key operation list the chain engine commits, in
    /// deterministic order.
    pub(crate) fn delta(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let mut ops = Vec::with_capacity(
            self.balance_changes.len() + self.storage_writes.len() + 2,
        );
        for (token, balance) in &self.balance_changes {
            ops.push((
                balance_key(&self.address, token),
                Some(rlp::encode(balance).to_vec()),
            ));
        }
        for (key, value) in &self.storage_writes {
            ops.push((storage_key(&self.address, key), value.clone()));
        }
        if let Some((code_type, code)) = &self.code {
            let mut s = RlpStream::new_list(2);
            s.append(code_type).append(code);
            ops.push((code_key(&self.address), Some(s.out().to_vec())));
        }
        if let Some(meta) = self.contract_meta {
            ops.push((
                contract_meta_key(&self.address),
                Some(rlp::encode(&meta).to_vec()),
            ));
        }
        ops
    }
}

/// A block paired with its computed state delta. Owned by the VM until it is
/// handed to the chain engine, which then assumes ownership.
pub struct VmAccountBlock {
    pub block: AccountBlock,
    pub state: VmDb,
}

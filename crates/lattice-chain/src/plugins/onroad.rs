// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! On-road accounting plugin: tracks, per receiver address, the sends that
//! have been admitted but whose paired receives have not, as an unconfirmed
//! pair cache plus persistent per-(address, token) totals.

use crate::{
    chain::ChainReader,
    error::{ChainError, Result},
    event::ChainListener,
};
use lattice_chain_db::{
    index_db::{onroad_meta_key, onroad_meta_prefix, token_of_onroad_meta_key},
    IndexDb, StoreBatch,
};
use lattice_types::{Address, Hash, TokenId, U256};
use parking_lot::RwLock;
use primitives::{AccountBlock, SnapshotChunk};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::{
    collections::HashMap,
    sync::Arc,
};

/// Persistent per-(address, token) pending totals. An entry exists only
/// while both values are positive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OnRoadMeta {
    pub total_amount: U256,
    pub count: u64,
}

impl Encodable for OnRoadMeta {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2).append(&self.total_amount).append(&self.count);
    }
}

impl Decodable for OnRoadMeta {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, DecoderError> {
        Ok(OnRoadMeta {
            total_amount: rlp.val_at(0)?,
            count: rlp.val_at(1)?,
        })
    }
}

/// Pair state of one send hash inside the unconfirmed window.
#[derive(Clone, Debug)]
pub enum Pending {
    OnlySend(AccountBlock),
    OnlyReceive(AccountBlock),
    /// Both ends passed through the unconfirmed window; they cancel out.
    Paired,
}

/// Aggregated on-road view for one address.
#[derive(Clone, Debug, Default)]
pub struct OnRoadInfo {
    pub address: Address,
    pub total_count: u64,
    pub tokens: HashMap<TokenId, OnRoadMeta>,
}

#[derive(Default)]
struct SignedMeta {
    add_amount: U256,
    add_count: u64,
    sub_amount: U256,
    sub_count: u64,
}

pub struct OnRoadPlugin {
    reader: Arc<dyn ChainReader>,
    index_db: Arc<IndexDb>,
    unconfirmed: RwLock<HashMap<Address, HashMap<Hash, Pending>>>,
}

impl OnRoadPlugin {
    pub fn new(reader: Arc<dyn ChainReader>, index_db: Arc<IndexDb>) -> Self {
        OnRoadPlugin {
            reader,
            index_db,
            unconfirmed: RwLock::new(HashMap::new()),
        }
    }

    /// Pending metadata merged from the persistent store and the signed
    /// unconfirmed aggregate.
    pub fn account_info(&self, addr: &Address) -> Result<OnRoadInfo> {
        let mut tokens = self.read_metas(addr)?;

        let pending_blocks: Vec<AccountBlock> = {
            let unconfirmed = self.unconfirmed.read();
            unconfirmed
                .get(addr)
                .map(|entries| {
                    entries
                        .values()
                        .filter_map(|pending| match pending {
                            Pending::OnlySend(block) => Some(block.clone()),
                            Pending::OnlyReceive(block) => {
                                Some(block.clone())
                            }
                            Pending::Paired => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let signed = self.aggregate_blocks(&pending_blocks)?;

        for (token, delta) in signed {
            let meta = tokens.remove(&token).unwrap_or_default();
            let amount = meta
                .total_amount
                .checked_add(delta.add_amount)
                .and_then(|v| v.checked_sub(delta.sub_amount));
            let count = meta
                .count
                .checked_add(delta.add_count)
                .and_then(|v| v.checked_sub(delta.sub_count));
            let (amount, count) = match (amount, count) {
                (Some(a), Some(c)) if (a.is_zero()) == (c == 0) => (a, c),
                _ => {
                    return Err(ChainError::Msg(format!(
                        "conflict, fail to get onroad info: addr={} token={}",
                        addr, token
                    )))
                }
            };
            if count > 0 {
                tokens.insert(token, OnRoadMeta { total_amount: amount, count });
            }
        }

        let total_count = tokens.values().map(|m| m.count).sum();
        Ok(OnRoadInfo { address: *addr, total_count, tokens })
    }

    /// Recomputes the persistent metadata from the index's on-road lists,
    /// bypassing the flush cycle. Offline recovery only.
    pub fn rebuild(&self) -> Result<()> {
        let mut per_addr: HashMap<Address, HashMap<TokenId, OnRoadMeta>> =
            HashMap::new();
        for (addr, send_hash) in self.index_db.all_onroad()? {
            let send = self
                .reader
                .get_account_block_by_hash(&send_hash)?
                .ok_or_else(|| {
                    ChainError::Msg(format!(
                        "can't find the onroad block by hash {:?}",
                        send_hash
                    ))
                })?;
            let meta = per_addr
                .entry(addr)
                .or_default()
                .entry(send.token_id)
                .or_default();
            meta.total_amount = meta.total_amount.saturating_add(send.amount);
            meta.count += 1;
        }
        let mut batch = StoreBatch::new();
        for (addr, tokens) in per_addr {
            for (token, meta) in tokens {
                batch.put(
                    onroad_meta_key(&addr, &token),
                    rlp::encode(&meta).to_vec(),
                );
            }
        }
        self.index_db.store().write_directly(batch)?;
        info!("onroad metadata rebuilt");
        Ok(())
    }

    fn read_metas(
        &self, addr: &Address,
    ) -> Result<HashMap<TokenId, OnRoadMeta>> {
        let prefix = onroad_meta_prefix(addr);
        let mut metas = HashMap::new();
        for (key, value) in self.index_db.store().iter_with_prefix(&prefix)? {
            let token = token_of_onroad_meta_key(&key)
                .ok_or_else(|| ChainError::Msg("bad onroad meta key".into()))?;
            metas.insert(token, rlp::decode::<OnRoadMeta>(&value)?);
        }
        Ok(metas)
    }

    /// Cancels matched (send, receive) pairs; the survivors are grouped by
    /// the address whose pending view they change: a send belongs to its
    /// recipient, a receive to its own account.
    fn exclude_pair_trades(
        &self, blocks: &[AccountBlock],
    ) -> HashMap<Address, Vec<AccountBlock>> {
        let mut cut: HashMap<Hash, AccountBlock> = HashMap::new();
        let mut reduce = |key: Hash, block: &AccountBlock| {
            match cut.get(&key) {
                Some(existing)
                    if existing.is_send_block() != block.is_send_block() =>
                {
                    cut.remove(&key);
                }
                _ => {
                    cut.insert(key, block.clone());
                }
            }
        };
        for block in blocks {
            if block.is_send_block() {
                reduce(block.hash, block);
                continue;
            }
            reduce(block.from_block_hash, block);
            for child in &block.send_block_list {
                reduce(child.hash, child);
            }
        }

        let mut grouped: HashMap<Address, Vec<AccountBlock>> = HashMap::new();
        for block in cut.into_values() {
            let addr = if block.is_send_block() {
                block.to_address
            } else {
                block.account_address
            };
            grouped.entry(addr).or_default().push(block);
        }
        grouped
    }

    fn add_unconfirmed(&self, grouped: &HashMap<Address, Vec<AccountBlock>>) {
        let mut unconfirmed = self.unconfirmed.write();
        for (addr, blocks) in grouped {
            let entries = unconfirmed.entry(*addr).or_default();
            for block in blocks {
                if block.is_send_block() {
                    match entries.get(&block.hash) {
                        Some(Pending::OnlyReceive(_)) => {
                            entries.remove(&block.hash);
                        }
                        _ => {
                            entries.insert(
                                block.hash,
                                Pending::OnlySend(block.clone()),
                            );
                        }
                    }
                } else {
                    match entries.get(&block.from_block_hash) {
                        Some(Pending::OnlySend(_)) => {
                            entries.remove(&block.from_block_hash);
                        }
                        _ => {
                            entries.insert(
                                block.from_block_hash,
                                Pending::OnlyReceive(block.clone()),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Applies the removal transition table for blocks leaving the
    /// unconfirmed window (confirmed by a snapshot or rolled back).
    fn remove_unconfirmed(
        &self, grouped: &HashMap<Address, Vec<AccountBlock>>,
    ) -> Result<()> {
        let mut unconfirmed = self.unconfirmed.write();
        for (addr, blocks) in grouped {
            let entries = match unconfirmed.get_mut(addr) {
                Some(entries) => entries,
                None => continue,
            };
            for block in blocks {
                if block.is_receive_block() {
                    let key = block.from_block_hash;
                    match entries.get(&key) {
                        Some(Pending::OnlyReceive(_))
                        | Some(Pending::Paired) => {
                            entries.remove(&key);
                        }
                        Some(Pending::OnlySend(_)) => {
                            error!(
                                "unconfirmed cache inconsistent: remove receive, onroad {:?}",
                                key
                            );
                            entries.insert(key, Pending::Paired);
                        }
                        None => {
                            match self.reader.get_account_block_by_hash(&key)?
                            {
                                Some(send) => {
                                    entries.insert(
                                        key,
                                        Pending::OnlySend(send),
                                    );
                                }
                                None => {
                                    error!(
                                        "fail to fetch originating send, onroad {:?}",
                                        key
                                    );
                                    entries.insert(key, Pending::Paired);
                                }
                            }
                        }
                    }
                } else {
                    let key = block.hash;
                    match entries.get(&key) {
                        Some(Pending::OnlySend(_)) | Some(Pending::Paired) => {
                            entries.remove(&key);
                        }
                        Some(Pending::OnlyReceive(_)) => {
                            error!(
                                "unconfirmed cache inconsistent: remove send, onroad {:?}",
                                key
                            );
                            entries.insert(key, Pending::Paired);
                        }
                        None => {
                            // Both ends are leaving together.
                            entries.insert(key, Pending::Paired);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Signed per-token deltas of a reduced block list: unmatched sends
    /// credit the recipient, unmatched receives debit it by their send's
    /// amount.
    fn aggregate_blocks(
        &self, blocks: &[AccountBlock],
    ) -> Result<HashMap<TokenId, SignedMeta>> {
        let mut deltas: HashMap<TokenId, SignedMeta> = HashMap::new();
        for block in blocks {
            if block.is_send_block() {
                let delta = deltas.entry(block.token_id).or_default();
                delta.add_amount = delta.add_amount.saturating_add(block.amount);
                delta.add_count += 1;
            } else {
                let send = self
                    .reader
                    .get_account_block_by_hash(&block.from_block_hash)?
                    .ok_or_else(|| {
                        ChainError::Msg(format!(
                            "failed to find onroad by recv {:?}",
                            block.from_block_hash
                        ))
                    })?;
                let delta = deltas.entry(send.token_id).or_default();
                delta.sub_amount = delta.sub_amount.saturating_add(send.amount);
                delta.sub_count += 1;
            }
        }
        Ok(deltas)
    }

    /// Folds signed deltas into the persistent metadata. `confirm` applies
    /// them forward (snapshot insertion); otherwise they are reverted
    /// (snapshot rollback).
    fn flush_meta(
        &self, grouped: &HashMap<Address, Vec<AccountBlock>>, confirm: bool,
    ) -> Result<()> {
        let mut batch = StoreBatch::new();
        for (addr, blocks) in grouped {
            let signed = self.aggregate_blocks(blocks)?;
            for (token, delta) in signed {
                let key = onroad_meta_key(addr, &token);
                let meta = match self.index_db.store().get(&key)? {
                    Some(raw) => rlp::decode::<OnRoadMeta>(&raw)?,
                    None => OnRoadMeta::default(),
                };
                let (add_amount, add_count, sub_amount, sub_count) = if confirm
                {
                    (
                        delta.add_amount,
                        delta.add_count,
                        delta.sub_amount,
                        delta.sub_count,
                    )
                } else {
                    (
                        delta.sub_amount,
                        delta.sub_count,
                        delta.add_amount,
                        delta.add_count,
                    )
                };
                let amount = meta
                    .total_amount
                    .checked_add(add_amount)
                    .and_then(|v| v.checked_sub(sub_amount));
                let count = meta
                    .count
                    .checked_add(add_count)
                    .and_then(|v| v.checked_sub(sub_count));
                match (amount, count) {
                    (Some(amount), Some(count))
                        if (amount.is_zero()) == (count == 0) =>
                    {
                        if count == 0 {
                            batch.delete(key);
                        } else {
                            batch.put(
                                key,
                                rlp::encode(&OnRoadMeta {
                                    total_amount: amount,
                                    count,
                                })
                                .to_vec(),
                            );
                        }
                    }
                    _ => {
                        return Err(ChainError::Msg(format!(
                            "conflict, fail to update onroad info: addr={} token={}",
                            addr, token
                        )));
                    }
                }
            }
        }
        self.index_db.store().write(batch);
        Ok(())
    }
}

impl ChainListener for OnRoadPlugin {
    fn insert_account_blocks(&self, blocks: &[Arc<AccountBlock>]) {
        let owned: Vec<AccountBlock> =
            blocks.iter().map(|b| (**b).clone()).collect();
        let grouped = self.exclude_pair_trades(&owned);
        self.add_unconfirmed(&grouped);
    }

    fn insert_snapshot_chunks(&self, chunks: &[SnapshotChunk]) {
        for chunk in chunks {
            let grouped = self.exclude_pair_trades(&chunk.account_blocks);
            if let Err(e) = self.remove_unconfirmed(&grouped) {
                error!(
                    "removeUnconfirmed failed, sb [{} {:?}]: {}",
                    chunk.snapshot_block.height, chunk.snapshot_block.hash, e
                );
            }
            if let Err(e) = self.flush_meta(&grouped, true) {
                error!(
                    "onroad meta write failed, sb [{} {:?}]: {}",
                    chunk.snapshot_block.height, chunk.snapshot_block.hash, e
                );
            }
        }
    }

    fn delete_account_blocks(&self, blocks: &[Arc<AccountBlock>]) {
        let owned: Vec<AccountBlock> =
            blocks.iter().map(|b| (**b).clone()).collect();
        let grouped = self.exclude_pair_trades(&owned);
        if let Err(e) = self.remove_unconfirmed(&grouped) {
            error!("removeUnconfirmed failed on rollback: {}", e);
        }
    }

    fn delete_snapshot_chunks(&self, chunks: &[SnapshotChunk]) {
        let blocks: Vec<AccountBlock> = chunks
            .iter()
            .flat_map(|chunk| chunk.account_blocks.iter().cloned())
            .collect();
        if blocks.is_empty() {
            return;
        }
        let grouped = self.exclude_pair_trades(&blocks);
        self.unconfirmed.write().clear();
        if let Err(e) = self.flush_meta(&grouped, false) {
            error!("onroad meta revert failed: {}", e);
        }
    }
}

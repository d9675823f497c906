// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use lattice_types::Address;
use parking_lot::RwLock;
use primitives::{AccountBlock, SnapshotBlock};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Hot view of the unconfirmed frontier (C4): every admitted-but-unconfirmed
/// account block in insertion order, a per-address index over them, the
/// latest snapshot block, and rolled-up unconfirmed quota per address.
///
/// Mutators run only on the engine's write path; readers take the inner
/// read locks.
pub struct ChainCache {
    unconfirmed: RwLock<Vec<Arc<AccountBlock>>>,
    unconfirmed_by_address: RwLock<HashMap<Address, Vec<Arc<AccountBlock>>>>,
    latest_snapshot: RwLock<Arc<SnapshotBlock>>,
    unconfirmed_quota: RwLock<HashMap<Address, u64>>,
}

impl ChainCache {
    pub fn new(latest_snapshot: SnapshotBlock) -> Self {
        ChainCache {
            unconfirmed: RwLock::new(Vec::new()),
            unconfirmed_by_address: RwLock::new(HashMap::new()),
            latest_snapshot: RwLock::new(Arc::new(latest_snapshot)),
            unconfirmed_quota: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_account_block(&self, block: Arc<AccountBlock>) {
        self.unconfirmed.write().push(block.clone());
        self.unconfirmed_by_address
            .write()
            .entry(block.account_address)
            .or_default()
            .push(block.clone());
        *self
            .unconfirmed_quota
            .write()
            .entry(block.account_address)
            .or_default() += block.quota;
    }

    /// Removes the confirmed blocks from the unconfirmed view and advances
    /// the latest snapshot.
    pub fn insert_snapshot_block(
        &self, snapshot_block: &SnapshotBlock, confirmed: &[AccountBlock],
    ) {
        let confirmed_hashes: HashSet<_> =
            confirmed.iter().map(|b| b.hash).collect();
        self.remove_blocks(&confirmed_hashes);
        *self.latest_snapshot.write() =
            Arc::new(snapshot_block.clone());
    }

    /// Removes rolled-back blocks from the unconfirmed view.
    pub fn rollback_account_blocks(&self, blocks: &[Arc<AccountBlock>]) {
        let hashes: HashSet<_> = blocks.iter().map(|b| b.hash).collect();
        self.remove_blocks(&hashes);
    }

    fn remove_blocks(&self, hashes: &HashSet<lattice_types::Hash>) {
        self.unconfirmed.write().retain(|b| !hashes.contains(&b.hash));
        let mut by_address = self.unconfirmed_by_address.write();
        by_address.retain(|_, list| {
            list.retain(|b| !hashes.contains(&b.hash));
            !list.is_empty()
        });
    }

    pub fn get_unconfirmed_blocks(&self) -> Vec<Arc<AccountBlock>> {
        self.unconfirmed.read().clone()
    }

    pub fn get_unconfirmed_blocks_by_address(
        &self, addr: &Address,
    ) -> Vec<Arc<AccountBlock>> {
        self.unconfirmed_by_address
            .read()
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_unconfirmed_block_by_hash(
        &self, hash: &lattice_types::Hash,
    ) -> Option<Arc<AccountBlock>> {
        self.unconfirmed
            .read()
            .iter()
            .find(|b| b.hash == *hash)
            .cloned()
    }

    pub fn latest_snapshot_block(&self) -> Arc<SnapshotBlock> {
        self.latest_snapshot.read().clone()
    }

    pub fn unconfirmed_quota_of(&self, addr: &Address) -> u64 {
        self.unconfirmed_quota
            .read()
            .get(addr)
            .copied()
            .unwrap_or(0)
    }

    /// Recomputes the per-address quota aggregate over the surviving
    /// unconfirmed set.
    pub fn reset_unconfirmed_quotas(&self, blocks: &[Arc<AccountBlock>]) {
        let mut quotas: HashMap<Address, u64> = HashMap::new();
        for block in blocks {
            *quotas.entry(block.account_address).or_default() += block.quota;
        }
        *self.unconfirmed_quota.write() = quotas;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::ADDRESS_TAG_USER;
    use primitives::BlockType;

    fn addr(n: u8) -> Address {
        Address::from_id([n; 20], ADDRESS_TAG_USER)
    }

    fn block(owner: u8, height: u64, quota: u64) -> Arc<AccountBlock> {
        let mut b = AccountBlock {
            block_type: BlockType::SendCall,
            account_address: addr(owner),
            height,
            quota,
            ..Default::default()
        };
        b.seal();
        Arc::new(b)
    }

    #[test]
    fn insertion_order_is_preserved() {
        let cache = ChainCache::new(Default::default());
        let a1 = block(1, 1, 10);
        let b1 = block(2, 1, 20);
        let a2 = block(1, 2, 30);
        cache.insert_account_block(a1.clone());
        cache.insert_account_block(b1.clone());
        cache.insert_account_block(a2.clone());

        let all = cache.get_unconfirmed_blocks();
        assert_eq!(
            all.iter().map(|b| b.hash).collect::<Vec<_>>(),
            vec![a1.hash, b1.hash, a2.hash]
        );
        assert_eq!(
            cache.get_unconfirmed_blocks_by_address(&addr(1)).len(),
            2
        );
        assert_eq!(cache.unconfirmed_quota_of(&addr(1)), 40);
    }

    #[test]
    fn snapshot_confirmation_trims_unconfirmed() {
        let cache = ChainCache::new(Default::default());
        let a1 = block(1, 1, 10);
        let a2 = block(1, 2, 10);
        cache.insert_account_block(a1.clone());
        cache.insert_account_block(a2.clone());

        let mut sb = SnapshotBlock::default();
        sb.height = 2;
        sb.seal();
        cache.insert_snapshot_block(&sb, &[(*a1).clone()]);

        let rest = cache.get_unconfirmed_blocks();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].hash, a2.hash);
        assert_eq!(cache.latest_snapshot_block().height, 2);

        cache.reset_unconfirmed_quotas(&rest);
        assert_eq!(cache.unconfirmed_quota_of(&addr(1)), 10);
    }
}

// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{
    cache::ChainCache,
    error::{ChainError, Result},
    event::ChainListener,
};
use lattice_chain_db::{BlockDb, Flusher, IndexDb};
use lattice_statedb::{StateDb, VmAccountBlock, VmDb, VmDbContext};
use lattice_types::{Address, Hash, HashHeight};
use parking_lot::{Mutex, RwLock};
use primitives::{
    AccountBlock, BlockError, SnapshotBlock, SnapshotChunk, SnapshotContent,
};
use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Arc},
};
use threadpool::ThreadPool;

/// Read-only chain view handed to plugins and the executor.
pub trait ChainReader: Send + Sync {
    fn get_account_block_by_hash(
        &self, hash: &Hash,
    ) -> Result<Option<AccountBlock>>;
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ChainConfig {
    /// Per-address cap on aggregated unconfirmed quota; blocks beyond it
    /// are neither snapshotted nor retained after a snapshot.
    pub snapshot_quota_cap: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig { snapshot_quota_cap: 10_000_000 }
    }
}

/// The chain ingestion engine (C5). Owns the block log, the index database,
/// the state database and the unconfirmed cache; external callers hold only
/// read-only views.
pub struct Chain {
    config: ChainConfig,
    cache: Arc<ChainCache>,
    block_db: Arc<BlockDb>,
    index_db: Arc<IndexDb>,
    state_db: Arc<StateDb>,
    flusher: Arc<Flusher>,
    flush_lock: Arc<RwLock<()>>,
    listeners: RwLock<Vec<Arc<dyn ChainListener>>>,
    worker_pool: Mutex<ThreadPool>,
}

impl Chain {
    pub fn new(
        config: ChainConfig, block_db: Arc<BlockDb>, index_db: Arc<IndexDb>,
        state_db: Arc<StateDb>, flusher: Arc<Flusher>,
        flush_lock: Arc<RwLock<()>>, genesis: SnapshotBlock,
    ) -> Result<Arc<Self>> {
        let latest = match index_db.latest_snapshot()? {
            Some(head) => {
                let location = index_db
                    .location_by_hash(&head.hash)?
                    .ok_or("latest snapshot has no location")?;
                block_db
                    .read_snapshot_block(location)?
                    .ok_or("latest snapshot not in block log")?
            }
            None => {
                let chunk = SnapshotChunk {
                    snapshot_block: genesis.clone(),
                    account_blocks: Vec::new(),
                };
                let (ab_locations, sb_location) = block_db.write(&chunk)?;
                index_db.insert_snapshot_block(
                    &genesis,
                    &[],
                    sb_location,
                    &ab_locations,
                )?;
                info!(
                    "chain initialized at genesis snapshot {}",
                    genesis.height
                );
                genesis
            }
        };
        Ok(Arc::new(Chain {
            config,
            cache: Arc::new(ChainCache::new(latest)),
            block_db,
            index_db,
            state_db,
            flusher,
            flush_lock,
            listeners: RwLock::new(Vec::new()),
            worker_pool: Mutex::new(ThreadPool::new(2)),
        }))
    }

    pub fn register_listener(&self, listener: Arc<dyn ChainListener>) {
        self.listeners.write().push(listener);
    }

    pub fn cache(&self) -> &Arc<ChainCache> { &self.cache }

    pub fn index_db(&self) -> &Arc<IndexDb> { &self.index_db }

    pub fn state_db(&self) -> &Arc<StateDb> { &self.state_db }

    pub fn latest_snapshot_block(&self) -> Arc<SnapshotBlock> {
        self.cache.latest_snapshot_block()
    }

    pub fn get_unconfirmed_blocks(
        &self, addr: &Address,
    ) -> Vec<Arc<AccountBlock>> {
        self.cache.get_unconfirmed_blocks_by_address(addr)
    }

    pub fn get_all_unconfirmed_blocks(&self) -> Vec<Arc<AccountBlock>> {
        self.cache.get_unconfirmed_blocks()
    }

    /// Admits one executed account block: cache, then index, then state,
    /// under the flush read lock. Index or state failure here is fatal; a
    /// partial write would leave the caches inconsistent with durable
    /// storage.
    pub fn insert_account_block(&self, vm_block: VmAccountBlock) -> Result<()> {
        debug!(
            "insert account block {} {} {:?}",
            vm_block.block.account_address,
            vm_block.block.height,
            vm_block.block.hash
        );
        let _guard = self.flush_lock.read();

        self.check_continuity(&vm_block.block)?;

        let block = Arc::new(vm_block.block.clone());
        let blocks = [block.clone()];
        for listener in self.listeners.read().iter() {
            listener.prepare_insert_account_blocks(&blocks)?;
        }

        self.cache.insert_account_block(block.clone());

        if let Err(e) = self.index_db.insert_account_block(&vm_block.block) {
            error!(
                "index write failed for block {:?}: {}",
                vm_block.block.hash, e
            );
            panic!("index write failed: {}", e);
        }
        if let Err(e) = self.state_db.write_block(&vm_block) {
            error!(
                "state write failed for block {:?}: {}",
                vm_block.block.hash, e
            );
            panic!("state write failed: {}", e);
        }

        for listener in self.listeners.read().iter() {
            listener.insert_account_blocks(&blocks);
        }
        Ok(())
    }

    /// Confirms a prefix of the unconfirmed set, then rolls back whatever
    /// the snapshot's filter invalidated. Returns the invalidated blocks.
    pub fn insert_snapshot_block(
        &self, snapshot_block: SnapshotBlock,
    ) -> Result<Vec<Arc<AccountBlock>>> {
        debug!(
            "insert snapshot block {} {:?}",
            snapshot_block.height, snapshot_block.hash
        );
        let insertion = catch_unwind(AssertUnwindSafe(|| {
            self.insert_snapshot_block_inner(&snapshot_block)
        }));
        match insertion {
            Ok(result) => result?,
            Err(panic) => {
                // Keep the durable stores clean of the half-written chunk
                // before letting the panic continue.
                self.flusher.abort();
                std::panic::resume_unwind(panic);
            }
        }

        let invalid = self.filter_unconfirmed_blocks();
        if !invalid.is_empty() {
            warn!(
                "snapshot {} invalidated {} unconfirmed blocks",
                snapshot_block.height,
                invalid.len()
            );
            self.delete_account_blocks(invalid.clone())?;
        }
        self.cache
            .reset_unconfirmed_quotas(&self.cache.get_unconfirmed_blocks());
        Ok(invalid)
    }

    fn insert_snapshot_block_inner(
        &self, snapshot_block: &SnapshotBlock,
    ) -> Result<()> {
        let _guard = self.flush_lock.read();

        let confirmed =
            self.blocks_to_be_confirmed(snapshot_block)?;
        let chunk = SnapshotChunk {
            snapshot_block: snapshot_block.clone(),
            account_blocks: confirmed.clone(),
        };
        let chunks = [chunk];
        for listener in self.listeners.read().iter() {
            listener.prepare_insert_snapshot_chunks(&chunks)?;
        }
        let chunk = &chunks[0];

        let (ab_locations, sb_location) = match self.block_db.write(chunk) {
            Ok(locations) => locations,
            Err(e) => {
                error!(
                    "block log write failed for snapshot {}: {}",
                    snapshot_block.height, e
                );
                panic!("block log write failed: {}", e);
            }
        };

        // Index+cache and state fan out in parallel and join; either both
        // land or the flusher aborts the whole chunk.
        let (sender, receiver) = mpsc::channel();
        {
            let pool = self.worker_pool.lock();

            let index_db = self.index_db.clone();
            let cache = self.cache.clone();
            let sb = snapshot_block.clone();
            let blocks = confirmed.clone();
            let tx = sender.clone();
            pool.execute(move || {
                let result = index_db
                    .insert_snapshot_block(
                        &sb,
                        &blocks,
                        sb_location,
                        &ab_locations,
                    )
                    .map_err(|e| e.to_string());
                if result.is_ok() {
                    cache.insert_snapshot_block(&sb, &blocks);
                }
                let _ = tx.send(result);
            });

            let state_db = self.state_db.clone();
            let sb = snapshot_block.clone();
            let blocks = confirmed;
            let tx = sender.clone();
            pool.execute(move || {
                let _ = tx.send(
                    state_db
                        .insert_snapshot_block(&sb, &blocks)
                        .map_err(|e| e.to_string()),
                );
            });
        }
        for _ in 0..2 {
            match receiver.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "snapshot {} fan-out write failed: {}",
                        snapshot_block.height, e
                    );
                    self.flusher.abort();
                    panic!("snapshot fan-out write failed: {}", e);
                }
                Err(e) => {
                    self.flusher.abort();
                    panic!("snapshot fan-out worker lost: {}", e);
                }
            }
        }

        for listener in self.listeners.read().iter() {
            listener.insert_snapshot_chunks(&chunks);
        }
        Ok(())
    }

    /// The ordered prefix of the unconfirmed set this snapshot confirms: a
    /// block is included when its address is named and its height does not
    /// exceed the named head. The scan stops once every named head has been
    /// matched exactly; falling off the end first means the snapshot names
    /// work this node does not have.
    fn blocks_to_be_confirmed(
        &self, snapshot_block: &SnapshotBlock,
    ) -> Result<Vec<AccountBlock>> {
        let content = &snapshot_block.content;
        if content.is_empty() {
            return Ok(Vec::new());
        }
        let blocks = self.cache.get_unconfirmed_blocks();
        let mut confirmed = Vec::with_capacity(blocks.len());
        let mut finish_count = 0;
        for block in &blocks {
            if let Some(head) = content.get(&block.account_address) {
                if block.height < head.height {
                    confirmed.push((**block).clone());
                } else if block.height == head.height {
                    confirmed.push((**block).clone());
                    finish_count += 1;
                }
            }
            if finish_count >= content.len() {
                return Ok(confirmed);
            }
        }
        Err(ChainError::LackBlock {
            snapshot: snapshot_block.hash,
            detail: format!(
                "content names {} heads, only {} matched among {} unconfirmed",
                content.len(),
                finish_count,
                blocks.len()
            ),
        })
    }

    /// Rolls back unconfirmed blocks together with everything that depends
    /// on them: later blocks on the same address chain, and receives whose
    /// send is being removed (including embedded child sends).
    pub fn delete_account_blocks(
        &self, blocks: Vec<Arc<AccountBlock>>,
    ) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let all = self.cache.get_unconfirmed_blocks();

        let mut doomed: HashSet<Hash> = HashSet::new();
        let mut doomed_sends: HashSet<Hash> = HashSet::new();
        let mut min_height: HashMap<Address, u64> = HashMap::new();
        let mut mark = |block: &AccountBlock,
                        doomed: &mut HashSet<Hash>,
                        doomed_sends: &mut HashSet<Hash>,
                        min_height: &mut HashMap<Address, u64>| {
            doomed.insert(block.hash);
            if block.is_send_block() {
                doomed_sends.insert(block.hash);
            }
            for child in &block.send_block_list {
                doomed_sends.insert(child.hash);
            }
            let entry = min_height
                .entry(block.account_address)
                .or_insert(block.height);
            if block.height < *entry {
                *entry = block.height;
            }
        };
        for block in &blocks {
            mark(block, &mut doomed, &mut doomed_sends, &mut min_height);
        }
        loop {
            let mut changed = false;
            for block in &all {
                if doomed.contains(&block.hash) {
                    continue;
                }
                let later_on_chain = min_height
                    .get(&block.account_address)
                    .map_or(false, |h| block.height >= *h);
                let orphaned_receive = block.is_receive_block()
                    && doomed_sends.contains(&block.from_block_hash);
                if later_on_chain || orphaned_receive {
                    mark(
                        block,
                        &mut doomed,
                        &mut doomed_sends,
                        &mut min_height,
                    );
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let ordered: Vec<Arc<AccountBlock>> = all
            .into_iter()
            .filter(|b| doomed.contains(&b.hash))
            .collect();
        let owned: Vec<AccountBlock> =
            ordered.iter().map(|b| (**b).clone()).collect();

        debug!("deleting {} unconfirmed blocks", ordered.len());
        self.state_db.rollback_account_blocks(&owned)?;
        self.index_db.delete_account_blocks(&owned)?;
        self.cache.rollback_account_blocks(&ordered);

        for listener in self.listeners.read().iter() {
            listener.delete_account_blocks(&ordered);
        }
        Ok(())
    }

    /// Latest per-address unconfirmed head among the blocks that pass the
    /// snapshot filter.
    pub fn get_content_need_snapshot(&self) -> SnapshotContent {
        let (snappable, _) = self.partition_unconfirmed();
        let mut content = SnapshotContent::new();
        for block in snappable.iter().rev() {
            content
                .entry(block.account_address)
                .or_insert(HashHeight {
                    hash: block.hash,
                    height: block.height,
                });
        }
        content
    }

    fn filter_unconfirmed_blocks(&self) -> Vec<Arc<AccountBlock>> {
        let (_, invalid) = self.partition_unconfirmed();
        invalid
    }

    /// Splits the unconfirmed set into blocks that may be snapshotted and
    /// blocks that are invalid under the dependency/quota filter. A block
    /// fails when its chain does not extend the confirmed head, when it is
    /// a receive whose send is unknown or itself failing, or when its
    /// address exceeds the per-snapshot quota cap; every later block of the
    /// same address fails with it.
    fn partition_unconfirmed(
        &self,
    ) -> (Vec<Arc<AccountBlock>>, Vec<Arc<AccountBlock>>) {
        let blocks = self.cache.get_unconfirmed_blocks();

        let mut child_sends: HashSet<Hash> = HashSet::new();
        for block in &blocks {
            for child in &block.send_block_list {
                child_sends.insert(child.hash);
            }
        }

        let mut expected: HashMap<Address, HashHeight> = HashMap::new();
        let mut quota_used: HashMap<Address, u64> = HashMap::new();
        let mut failed_addrs: HashSet<Address> = HashSet::new();
        let mut failed_sends: HashSet<Hash> = HashSet::new();
        let mut valid = Vec::new();
        let mut invalid = Vec::new();

        for block in blocks {
            let addr = block.account_address;
            let mut ok = !failed_addrs.contains(&addr);

            if ok {
                let head = match expected.get(&addr) {
                    Some(head) => Some(*head),
                    None => self
                        .index_db
                        .confirmed_head(&addr)
                        .ok()
                        .flatten(),
                };
                match head {
                    Some(head) => {
                        ok = block.height == head.height + 1
                            && block.prev_hash == head.hash;
                    }
                    None => {
                        ok = block.height == 1
                            && block.prev_hash.is_zero();
                    }
                }
            }

            if ok && block.is_receive_block() {
                let send = &block.from_block_hash;
                if failed_sends.contains(send) {
                    ok = false;
                } else {
                    let known = self.send_exists(send, &child_sends);
                    ok = known;
                }
            }

            if ok {
                let used = quota_used.entry(addr).or_insert(0);
                *used += block.quota;
                if *used > self.config.snapshot_quota_cap {
                    ok = false;
                }
            }

            if ok {
                let last_height =
                    block.height + block.send_block_list.len() as u64;
                let last_hash = block
                    .send_block_list
                    .last()
                    .map(|child| child.hash)
                    .unwrap_or(block.hash);
                expected.insert(
                    addr,
                    HashHeight { hash: last_hash, height: last_height },
                );
                valid.push(block);
            } else {
                failed_addrs.insert(addr);
                if block.is_send_block() {
                    failed_sends.insert(block.hash);
                }
                for child in &block.send_block_list {
                    failed_sends.insert(child.hash);
                }
                invalid.push(block);
            }
        }
        (valid, invalid)
    }

    fn send_exists(
        &self, send_hash: &Hash, unconfirmed_children: &HashSet<Hash>,
    ) -> bool {
        if unconfirmed_children.contains(send_hash) {
            return true;
        }
        if self
            .cache
            .get_unconfirmed_block_by_hash(send_hash)
            .is_some()
        {
            return true;
        }
        matches!(self.index_db.location_by_hash(send_hash), Ok(Some(_)))
    }

    fn check_continuity(&self, block: &AccountBlock) -> Result<()> {
        let addr = &block.account_address;
        let head = match self
            .cache
            .get_unconfirmed_blocks_by_address(addr)
            .last()
        {
            Some(prev) => Some(HashHeight {
                hash: prev
                    .send_block_list
                    .last()
                    .map(|child| child.hash)
                    .unwrap_or(prev.hash),
                height: prev.height + prev.send_block_list.len() as u64,
            }),
            None => self.index_db.confirmed_head(addr)?,
        };
        match head {
            Some(head) => {
                if block.height != head.height + 1 {
                    return Err(BlockError::InvalidHeight {
                        expected: head.height + 1,
                        got: block.height,
                    }
                    .into());
                }
                if block.prev_hash != head.hash {
                    return Err(BlockError::InvalidPrevHash {
                        expected: head.hash,
                        got: block.prev_hash,
                    }
                    .into());
                }
            }
            None => {
                if block.height != 1 {
                    return Err(BlockError::InvalidHeight {
                        expected: 1,
                        got: block.height,
                    }
                    .into());
                }
                if !block.prev_hash.is_zero() {
                    return Err(BlockError::InvalidPrevHash {
                        expected: Hash::zero(),
                        got: block.prev_hash,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Builds the execution context for a block on `addr`'s chain; the
    /// executor runs against it through a fresh `VmDb`.
    pub fn vm_db_context(
        &self, addr: &Address, send_hash: Option<&Hash>,
    ) -> Result<VmDbContext> {
        let prev = match self
            .cache
            .get_unconfirmed_blocks_by_address(addr)
            .last()
        {
            Some(prev) => Some(HashHeight {
                hash: prev
                    .send_block_list
                    .last()
                    .map(|child| child.hash)
                    .unwrap_or(prev.hash),
                height: prev.height + prev.send_block_list.len() as u64,
            }),
            None => self.index_db.confirmed_head(addr)?,
        };
        let latest = self.cache.latest_snapshot_block();
        let call_depth = match send_hash {
            Some(hash) => self.index_db.send_depth(hash)?,
            None => 0,
        };
        Ok(VmDbContext {
            prev_account_block: prev,
            latest_snapshot: HashHeight {
                hash: latest.hash,
                height: latest.height,
            },
            snapshot_timestamp: latest.timestamp,
            call_depth,
            unconfirmed_count: self
                .cache
                .get_unconfirmed_blocks_by_address(addr)
                .len() as u64,
        })
    }

    pub fn new_vm_db(
        &self, addr: Address, send_hash: Option<&Hash>,
    ) -> Result<VmDb> {
        let ctx = self.vm_db_context(&addr, send_hash)?;
        Ok(self.state_db.new_vm_db(addr, ctx))
    }
}

impl ChainReader for Chain {
    /// Resolves a block by hash: the unconfirmed cache first (top-level
    /// blocks, then embedded child sends), then the confirmed log.
    fn get_account_block_by_hash(
        &self, hash: &Hash,
    ) -> Result<Option<AccountBlock>> {
        if let Some(block) = self.cache.get_unconfirmed_block_by_hash(hash) {
            return Ok(Some((*block).clone()));
        }
        for block in self.cache.get_unconfirmed_blocks() {
            for child in &block.send_block_list {
                if child.hash == *hash {
                    return Ok(Some(child.clone()));
                }
            }
        }
        let location = match self.index_db.location_by_hash(hash)? {
            None => return Ok(None),
            Some(location) => location,
        };
        let block = match self.block_db.read_account_block(location)? {
            None => return Ok(None),
            Some(block) => block,
        };
        if block.hash == *hash {
            return Ok(Some(block));
        }
        // A child send maps to its parent's location.
        for child in &block.send_block_list {
            if child.hash == *hash {
                return Ok(Some(child.clone()));
            }
        }
        Ok(None)
    }
}

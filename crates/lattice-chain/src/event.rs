// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::error::Result;
use primitives::{AccountBlock, SnapshotChunk};
use std::sync::Arc;

/// Lifecycle hooks fired by the chain engine. Plugins (on-road accounting,
/// trace logging, ...) implement this and register with the engine.
///
/// `prepare_*` runs before any store is touched and may veto the insertion;
/// the commit-side hooks run after the writes landed. Listeners receive
/// borrowed data and must not retain references past the call.
pub trait ChainListener: Send + Sync {
    fn prepare_insert_account_blocks(
        &self, _blocks: &[Arc<AccountBlock>],
    ) -> Result<()> {
        Ok(())
    }

    fn insert_account_blocks(&self, _blocks: &[Arc<AccountBlock>]) {}

    fn prepare_insert_snapshot_chunks(
        &self, _chunks: &[SnapshotChunk],
    ) -> Result<()> {
        Ok(())
    }

    fn insert_snapshot_chunks(&self, _chunks: &[SnapshotChunk]) {}

    fn delete_account_blocks(&self, _blocks: &[Arc<AccountBlock>]) {}

    fn delete_snapshot_chunks(&self, _chunks: &[SnapshotChunk]) {}
}

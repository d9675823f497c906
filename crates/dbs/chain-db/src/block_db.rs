// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::store::{Store, StoreBatch};
use byteorder::{BigEndian, ByteOrder};
use lattice_db_errors::storage::{Error, Result};
use primitives::{AccountBlock, SnapshotBlock, SnapshotChunk};
use rlp::{Rlp, RlpStream};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Opaque byte-offset token handed to the index layer. Internally a
/// sequence number in the append-only log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(pub u64);

impl rlp::Encodable for Location {
    fn rlp_append(&self, s: &mut RlpStream) {
        rlp::Encodable::rlp_append(&self.0, s);
    }
}

impl rlp::Decodable for Location {
    fn decode(rlp: &Rlp) -> std::result::Result<Self, rlp::DecoderError> {
        Ok(Location(rlp.as_val()?))
    }
}

const TAG_ACCOUNT: u8 = 0;
const TAG_SNAPSHOT: u8 = 1;

const KEY_NEXT_SEQ: &[u8] = b"m:next_seq";

fn seq_key(seq: u64) -> Vec<u8> {
    let mut key = vec![b'b'; 9];
    BigEndian::write_u64(&mut key[1..], seq);
    key
}

/// Append-only log of account and snapshot blocks (C1). Entries are written
/// chunk-at-a-time and addressed by `Location`.
pub struct BlockDb {
    store: Arc<Store>,
    next_seq: AtomicU64,
}

impl BlockDb {
    pub fn new(store: Arc<Store>) -> Result<Self> {
        let next_seq = match store.get(KEY_NEXT_SEQ)? {
            Some(raw) => Rlp::new(&raw).as_val()?,
            None => 0,
        };
        Ok(BlockDb {
            store,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Appends a snapshot chunk: the confirmed account blocks in replay
    /// order, then the snapshot block itself. Returns the account-block
    /// locations and the snapshot-block location.
    pub fn write(
        &self, chunk: &SnapshotChunk,
    ) -> Result<(Vec<Location>, Location)> {
        let mut seq = self.next_seq.load(Ordering::SeqCst);
        let mut batch = StoreBatch::new();
        let mut ab_locations = Vec::with_capacity(chunk.account_blocks.len());
        for block in &chunk.account_blocks {
            let mut entry = RlpStream::new_list(2);
            entry.append(&TAG_ACCOUNT).append(block);
            batch.put(seq_key(seq), entry.out().to_vec());
            ab_locations.push(Location(seq));
            seq += 1;
        }
        let sb_location = Location(seq);
        let mut entry = RlpStream::new_list(2);
        entry.append(&TAG_SNAPSHOT).append(&chunk.snapshot_block);
        batch.put(seq_key(seq), entry.out().to_vec());
        seq += 1;
        batch.put(
            KEY_NEXT_SEQ.to_vec(),
            rlp::encode(&seq).to_vec(),
        );
        self.store.write(batch);
        self.next_seq.store(seq, Ordering::SeqCst);
        trace!(
            "block log appended {} account blocks + snapshot {}",
            ab_locations.len(),
            chunk.snapshot_block.height
        );
        Ok((ab_locations, sb_location))
    }

    pub fn read_account_block(
        &self, location: Location,
    ) -> Result<Option<AccountBlock>> {
        self.read_raw(location)
    }

    pub fn read_snapshot_block(
        &self, location: Location,
    ) -> Result<Option<SnapshotBlock>> {
        match self.store.get(&seq_key(location.0))? {
            None => Ok(None),
            Some(raw) => {
                let rlp = Rlp::new(&raw);
                if rlp.val_at::<u8>(0)? != TAG_SNAPSHOT {
                    return Ok(None);
                }
                Ok(Some(rlp.val_at(1)?))
            }
        }
    }

    fn read_raw(&self, location: Location) -> Result<Option<AccountBlock>> {
        if location.0 >= self.next_seq.load(Ordering::SeqCst) {
            return Err(Error::LocationOutOfRange(location.0));
        }
        match self.store.get(&seq_key(location.0))? {
            None => Ok(None),
            Some(raw) => {
                let rlp = Rlp::new(&raw);
                if rlp.val_at::<u8>(0)? != TAG_ACCOUNT {
                    return Ok(None);
                }
                Ok(Some(rlp.val_at(1)?))
            }
        }
    }

    /// Current end of the log; everything below it is already appended.
    pub fn checkpoint(&self) -> u64 { self.next_seq.load(Ordering::SeqCst) }

    /// Rolls the log back to a previously recorded checkpoint.
    pub fn truncate_to(&self, checkpoint: u64) -> Result<()> {
        let current = self.next_seq.load(Ordering::SeqCst);
        if checkpoint > current {
            return Err(Error::LocationOutOfRange(checkpoint));
        }
        let mut batch = StoreBatch::new();
        for seq in checkpoint..current {
            batch.delete(seq_key(seq));
        }
        batch.put(
            KEY_NEXT_SEQ.to_vec(),
            rlp::encode(&checkpoint).to_vec(),
        );
        self.store.write(batch);
        self.next_seq.store(checkpoint, Ordering::SeqCst);
        debug!("block log truncated {} -> {}", current, checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitives::BlockType;

    fn block_db() -> BlockDb {
        let store =
            Arc::new(Store::new(Arc::new(kvdb_memorydb::create(1)), "blocks"));
        BlockDb::new(store).unwrap()
    }

    fn chunk_with(n: usize) -> SnapshotChunk {
        let mut chunk = SnapshotChunk::default();
        chunk.snapshot_block.height = 9;
        chunk.snapshot_block.seal();
        for i in 0..n {
            let mut block = AccountBlock {
                block_type: BlockType::SendCall,
                height: i as u64 + 1,
                ..Default::default()
            };
            block.seal();
            chunk.account_blocks.push(block);
        }
        chunk
    }

    #[test]
    fn write_then_read_back() {
        let db = block_db();
        let chunk = chunk_with(3);
        let (ab_locs, sb_loc) = db.write(&chunk).unwrap();
        assert_eq!(ab_locs.len(), 3);

        for (loc, expected) in ab_locs.iter().zip(&chunk.account_blocks) {
            let got = db.read_account_block(*loc).unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        let sb = db.read_snapshot_block(sb_loc).unwrap().unwrap();
        assert_eq!(sb, chunk.snapshot_block);

        // Mismatched readers see nothing rather than garbage.
        assert!(db.read_account_block(sb_loc).unwrap().is_none());
        assert!(db.read_snapshot_block(ab_locs[0]).unwrap().is_none());
    }

    #[test]
    fn truncate_restores_checkpoint() {
        let db = block_db();
        let checkpoint = db.checkpoint();
        let (ab_locs, _) = db.write(&chunk_with(2)).unwrap();
        db.truncate_to(checkpoint).unwrap();
        assert_eq!(db.checkpoint(), checkpoint);
        assert!(db.read_account_block(ab_locs[0]).is_err());
    }
}

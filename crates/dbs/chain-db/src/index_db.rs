// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{
    block_db::Location,
    store::{Store, StoreBatch},
};
use byteorder::{BigEndian, ByteOrder};
use lattice_db_errors::storage::Result;
use lattice_types::{Address, Hash, HashHeight, TokenId};
use primitives::{AccountBlock, SnapshotBlock};
use rlp::{Rlp, RlpStream};
use std::sync::Arc;

const PREFIX_LOCATION: u8 = 0x01;
const PREFIX_HEIGHT_INDEX: u8 = 0x02;
const PREFIX_RECEIVED_BY: u8 = 0x03;
const PREFIX_ONROAD: u8 = 0x04;
const PREFIX_CONFIRMED_SET: u8 = 0x05;
const PREFIX_CONFIRM_HEIGHT: u8 = 0x06;
const KEY_LATEST_SNAPSHOT: &[u8] = &[0x07];
const PREFIX_ONROAD_META: u8 = 0x08;
const PREFIX_SEND_DEPTH: u8 = 0x09;
const PREFIX_CONFIRMED_HEAD: u8 = 0x0a;

fn location_key(hash: &Hash) -> Vec<u8> {
    let mut key = vec![PREFIX_LOCATION];
    key.extend_from_slice(hash.as_bytes());
    key
}

fn height_key(addr: &Address, height: u64) -> Vec<u8> {
    let mut key = vec![PREFIX_HEIGHT_INDEX];
    key.extend_from_slice(addr.as_bytes());
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, height);
    key.extend_from_slice(&buf);
    key
}

fn received_by_key(send_hash: &Hash) -> Vec<u8> {
    let mut key = vec![PREFIX_RECEIVED_BY];
    key.extend_from_slice(send_hash.as_bytes());
    key
}

fn onroad_prefix(addr: &Address) -> Vec<u8> {
    let mut key = vec![PREFIX_ONROAD];
    key.extend_from_slice(addr.as_bytes());
    key
}

fn onroad_key(addr: &Address, send_hash: &Hash) -> Vec<u8> {
    let mut key = onroad_prefix(addr);
    key.extend_from_slice(send_hash.as_bytes());
    key
}

fn confirmed_set_key(height: u64) -> Vec<u8> {
    let mut key = vec![PREFIX_CONFIRMED_SET; 9];
    BigEndian::write_u64(&mut key[1..], height);
    key
}

fn confirm_height_key(hash: &Hash) -> Vec<u8> {
    let mut key = vec![PREFIX_CONFIRM_HEIGHT];
    key.extend_from_slice(hash.as_bytes());
    key
}

fn send_depth_key(hash: &Hash) -> Vec<u8> {
    let mut key = vec![PREFIX_SEND_DEPTH];
    key.extend_from_slice(hash.as_bytes());
    key
}

fn confirmed_head_key(addr: &Address) -> Vec<u8> {
    let mut key = vec![PREFIX_CONFIRMED_HEAD];
    key.extend_from_slice(addr.as_bytes());
    key
}

/// Key for the on-road plugin's persistent per-(address, token) metadata.
/// The plugin shares the index store and owns this prefix.
pub fn onroad_meta_key(addr: &Address, token: &TokenId) -> Vec<u8> {
    let mut key = vec![PREFIX_ONROAD_META];
    key.extend_from_slice(addr.as_bytes());
    key.extend_from_slice(token.as_bytes());
    key
}

pub fn onroad_meta_prefix(addr: &Address) -> Vec<u8> {
    let mut key = vec![PREFIX_ONROAD_META];
    key.extend_from_slice(addr.as_bytes());
    key
}

pub fn token_of_onroad_meta_key(key: &[u8]) -> Option<TokenId> {
    TokenId::from_slice(&key[1 + lattice_types::ADDRESS_SIZE..]).ok()
}

/// Secondary indices over admitted blocks (C2).
pub struct IndexDb {
    store: Arc<Store>,
}

impl IndexDb {
    pub fn new(store: Arc<Store>) -> Self { IndexDb { store } }

    pub fn store(&self) -> &Arc<Store> { &self.store }

    /// Index entries for a newly admitted account block, written in one
    /// batch: the (address, height) index, the send/receive pairing, the
    /// on-road pending list, and call depths for embedded child sends.
    pub fn insert_account_block(&self, block: &AccountBlock) -> Result<()> {
        let mut batch = StoreBatch::new();
        batch.put(
            height_key(&block.account_address, block.height),
            block.hash.as_bytes().to_vec(),
        );
        if block.is_send_block() {
            batch.put(onroad_key(&block.to_address, &block.hash), Vec::new());
        } else {
            batch.put(
                received_by_key(&block.from_block_hash),
                block.hash.as_bytes().to_vec(),
            );
            batch.delete(onroad_key(
                &block.account_address,
                &block.from_block_hash,
            ));
            let parent_depth = self.send_depth(&block.from_block_hash)?;
            for child in &block.send_block_list {
                batch.put(
                    height_key(&child.account_address, child.height),
                    child.hash.as_bytes().to_vec(),
                );
                batch.put(
                    onroad_key(&child.to_address, &child.hash),
                    Vec::new(),
                );
                batch.put(
                    send_depth_key(&child.hash),
                    rlp::encode(&(parent_depth + 1)).to_vec(),
                );
            }
        }
        self.store.write(batch);
        Ok(())
    }

    /// Removes every index entry written by `insert_account_block`, so an
    /// insert-then-delete leaves the store byte-identical.
    pub fn delete_account_blocks(&self, blocks: &[AccountBlock]) -> Result<()> {
        let mut batch = StoreBatch::new();
        for block in blocks.iter().rev() {
            batch.delete(height_key(&block.account_address, block.height));
            if block.is_send_block() {
                batch.delete(onroad_key(&block.to_address, &block.hash));
            } else {
                batch.delete(received_by_key(&block.from_block_hash));
                batch.put(
                    onroad_key(
                        &block.account_address,
                        &block.from_block_hash,
                    ),
                    Vec::new(),
                );
                for child in block.send_block_list.iter().rev() {
                    batch.delete(height_key(
                        &child.account_address,
                        child.height,
                    ));
                    batch.delete(onroad_key(&child.to_address, &child.hash));
                    batch.delete(send_depth_key(&child.hash));
                }
            }
        }
        self.store.write(batch);
        Ok(())
    }

    /// Snapshot-time entries: block locations, the confirmed set, per-block
    /// confirm heights, per-address confirmed heads and the latest-snapshot
    /// marker. Prunes nothing by itself; on-road entries were already
    /// removed when the receives were inserted.
    pub fn insert_snapshot_block(
        &self, snapshot_block: &SnapshotBlock, confirmed: &[AccountBlock],
        sb_location: Location, ab_locations: &[Location],
    ) -> Result<()> {
        let mut batch = StoreBatch::new();
        batch.put(
            location_key(&snapshot_block.hash),
            rlp::encode(&sb_location).to_vec(),
        );
        let mut set = RlpStream::new_list(confirmed.len());
        for (block, location) in confirmed.iter().zip(ab_locations) {
            batch.put(
                location_key(&block.hash),
                rlp::encode(location).to_vec(),
            );
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, snapshot_block.height);
            batch.put(confirm_height_key(&block.hash), buf.to_vec());
            // Embedded child sends resolve to the parent's location.
            for child in &block.send_block_list {
                batch.put(
                    location_key(&child.hash),
                    rlp::encode(location).to_vec(),
                );
                batch.put(confirm_height_key(&child.hash), buf.to_vec());
            }
            set.begin_list(3)
                .append(&block.account_address)
                .append(&block.height)
                .append(&block.hash);
        }
        batch.put(
            confirmed_set_key(snapshot_block.height),
            set.out().to_vec(),
        );
        for (addr, hash_height) in &snapshot_block.content {
            batch.put(
                confirmed_head_key(addr),
                rlp::encode(hash_height).to_vec(),
            );
        }
        batch.put(
            KEY_LATEST_SNAPSHOT.to_vec(),
            rlp::encode(&HashHeight {
                hash: snapshot_block.hash,
                height: snapshot_block.height,
            })
            .to_vec(),
        );
        self.store.write(batch);
        Ok(())
    }

    pub fn location_by_hash(&self, hash: &Hash) -> Result<Option<Location>> {
        match self.store.get(&location_key(hash))? {
            None => Ok(None),
            Some(raw) => Ok(Some(Rlp::new(&raw).as_val()?)),
        }
    }

    pub fn hash_by_height(
        &self, addr: &Address, height: u64,
    ) -> Result<Option<Hash>> {
        Ok(self
            .store
            .get(&height_key(addr, height))?
            .map(|raw| Hash::from_slice(&raw)))
    }

    pub fn receive_by_send(&self, send_hash: &Hash) -> Result<Option<Hash>> {
        Ok(self
            .store
            .get(&received_by_key(send_hash))?
            .map(|raw| Hash::from_slice(&raw)))
    }

    pub fn is_onroad(&self, addr: &Address, send_hash: &Hash) -> Result<bool> {
        Ok(self.store.get(&onroad_key(addr, send_hash))?.is_some())
    }

    /// All unreceived send hashes whose recipient is `addr`.
    pub fn onroad_hashes(&self, addr: &Address) -> Result<Vec<Hash>> {
        let prefix = onroad_prefix(addr);
        Ok(self
            .store
            .iter_with_prefix(&prefix)?
            .into_iter()
            .map(|(key, _)| Hash::from_slice(&key[prefix.len()..]))
            .collect())
    }

    /// Every on-road entry in the store, as (recipient, send hash) pairs.
    /// Only the offline rebuild path walks the full prefix.
    pub fn all_onroad(&self) -> Result<Vec<(Address, Hash)>> {
        let mut entries = Vec::new();
        for (key, _) in self.store.iter_with_prefix(&[PREFIX_ONROAD])? {
            let addr = Address::from_slice(
                &key[1..1 + lattice_types::ADDRESS_SIZE],
            )
            .map_err(|e| format!("bad onroad key: {}", e))?;
            let hash =
                Hash::from_slice(&key[1 + lattice_types::ADDRESS_SIZE..]);
            entries.push((addr, hash));
        }
        Ok(entries)
    }

    pub fn confirm_height(&self, hash: &Hash) -> Result<Option<u64>> {
        Ok(self
            .store
            .get(&confirm_height_key(hash))?
            .map(|raw| BigEndian::read_u64(&raw)))
    }

    pub fn confirmed_set(
        &self, snapshot_height: u64,
    ) -> Result<Vec<(Address, u64, Hash)>> {
        let raw = match self.store.get(&confirmed_set_key(snapshot_height))? {
            None => return Ok(Vec::new()),
            Some(raw) => raw,
        };
        let rlp = Rlp::new(&raw);
        let mut set = Vec::with_capacity(rlp.item_count()?);
        for entry in rlp.iter() {
            set.push((
                entry.val_at(0)?,
                entry.val_at(1)?,
                entry.val_at(2)?,
            ));
        }
        Ok(set)
    }

    pub fn confirmed_head(
        &self, addr: &Address,
    ) -> Result<Option<HashHeight>> {
        match self.store.get(&confirmed_head_key(addr))? {
            None => Ok(None),
            Some(raw) => Ok(Some(Rlp::new(&raw).as_val()?)),
        }
    }

    pub fn latest_snapshot(&self) -> Result<Option<HashHeight>> {
        match self.store.get(KEY_LATEST_SNAPSHOT)? {
            None => Ok(None),
            Some(raw) => Ok(Some(Rlp::new(&raw).as_val()?)),
        }
    }

    /// Call depth of a send block's contract chain. User sends have no
    /// entry and depth zero.
    pub fn send_depth(&self, send_hash: &Hash) -> Result<u16> {
        match self.store.get(&send_depth_key(send_hash))? {
            None => Ok(0),
            Some(raw) => Ok(Rlp::new(&raw).as_val()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitives::BlockType;

    fn index_db() -> IndexDb {
        IndexDb::new(Arc::new(Store::new(
            Arc::new(kvdb_memorydb::create(1)),
            "index",
        )))
    }

    fn addr(n: u8) -> Address {
        Address::from_id([n; 20], lattice_types::ADDRESS_TAG_USER)
    }

    fn send(from: Address, to: Address, height: u64) -> AccountBlock {
        let mut block = AccountBlock {
            block_type: BlockType::SendCall,
            account_address: from,
            to_address: to,
            height,
            ..Default::default()
        };
        block.seal();
        block
    }

    fn receive(of: &AccountBlock, height: u64) -> AccountBlock {
        let mut block = AccountBlock {
            block_type: BlockType::Receive,
            account_address: of.to_address,
            from_block_hash: of.hash,
            height,
            ..Default::default()
        };
        block.seal();
        block
    }

    #[test]
    fn send_receive_pairing_and_onroad() {
        let db = index_db();
        let s = send(addr(1), addr(2), 1);
        db.insert_account_block(&s).unwrap();
        assert!(db.is_onroad(&addr(2), &s.hash).unwrap());
        assert_eq!(db.onroad_hashes(&addr(2)).unwrap(), vec![s.hash]);

        let r = receive(&s, 1);
        db.insert_account_block(&r).unwrap();
        assert!(!db.is_onroad(&addr(2), &s.hash).unwrap());
        assert_eq!(db.receive_by_send(&s.hash).unwrap(), Some(r.hash));
        assert_eq!(
            db.hash_by_height(&addr(2), 1).unwrap(),
            Some(r.hash)
        );
    }

    #[test]
    fn insert_then_delete_restores_state() {
        let db = index_db();
        let s = send(addr(1), addr(2), 1);
        db.insert_account_block(&s).unwrap();
        let r = receive(&s, 1);
        db.insert_account_block(&r).unwrap();

        db.delete_account_blocks(&[r.clone()]).unwrap();
        assert_eq!(db.receive_by_send(&s.hash).unwrap(), None);
        assert!(db.is_onroad(&addr(2), &s.hash).unwrap());

        db.delete_account_blocks(&[s.clone()]).unwrap();
        assert!(!db.is_onroad(&addr(2), &s.hash).unwrap());
        assert_eq!(db.hash_by_height(&addr(1), 1).unwrap(), None);
    }

    #[test]
    fn child_sends_gain_depth() {
        let db = index_db();
        let s = send(addr(1), addr(2), 1);
        db.insert_account_block(&s).unwrap();

        let mut r = receive(&s, 1);
        let child = send(addr(2), addr(3), 2);
        r.send_block_list.push(child.clone());
        r.seal();
        db.insert_account_block(&r).unwrap();

        let child_hash = r.send_block_list[0].hash;
        assert_eq!(db.send_depth(&child_hash).unwrap(), 1);
        assert!(db.is_onroad(&addr(3), &child_hash).unwrap());
        assert_eq!(db.send_depth(&s.hash).unwrap(), 0);
    }
}

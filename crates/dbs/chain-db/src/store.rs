// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use kvdb::{DBTransaction, KeyValueDB};
use lattice_db_errors::storage::Result;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

/// A batch of staged operations against one store. `None` marks a deletion.
#[derive(Default)]
pub struct StoreBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl StoreBatch {
    pub fn new() -> Self { Default::default() }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    pub fn delete(&mut self, key: Vec<u8>) { self.ops.push((key, None)); }

    pub fn is_empty(&self) -> bool { self.ops.is_empty() }
}

/// One of the independently-opened column stores. Writes are staged in an
/// in-memory overlay and only reach the underlying database when the flusher
/// commits; readers merge the overlay over the database so they always see a
/// consistent prefix of the staged history.
pub struct Store {
    name: &'static str,
    db: Arc<dyn KeyValueDB>,
    overlay: RwLock<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

const COL: u32 = 0;

impl Store {
    pub fn new(db: Arc<dyn KeyValueDB>, name: &'static str) -> Self {
        Store {
            name,
            db,
            overlay: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str { self.name }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.overlay.read().get(key) {
            return Ok(staged.clone());
        }
        Ok(self.db.get(COL, key)?)
    }

    /// All live `(key, value)` pairs under `prefix`, overlay merged over the
    /// database, in key order.
    pub fn iter_with_prefix(
        &self, prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for entry in self.db.iter_with_prefix(COL, prefix) {
            let (key, value) = entry?;
            merged.insert(key.to_vec(), Some(value.to_vec()));
        }
        let overlay = self.overlay.read();
        for (key, staged) in
            overlay.range(prefix.to_vec()..).take_while(|(k, _)| {
                k.starts_with(prefix)
            })
        {
            merged.insert(key.clone(), staged.clone());
        }
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    /// Stages a batch into the overlay. Durability comes later, at the
    /// flusher's commit point.
    pub fn write(&self, batch: StoreBatch) {
        let mut overlay = self.overlay.write();
        for (key, value) in batch.ops {
            overlay.insert(key, value);
        }
    }

    /// Writes a batch straight to the database, bypassing the flush cycle.
    /// Used by offline rebuild paths only.
    pub fn write_directly(&self, batch: StoreBatch) -> Result<()> {
        let mut tx = DBTransaction::new();
        for (key, value) in batch.ops {
            match value {
                Some(value) => tx.put(COL, &key, &value),
                None => tx.delete(COL, &key),
            }
        }
        Ok(self.db.write(tx)?)
    }

    pub(crate) fn prepare(&self) -> DBTransaction {
        let overlay = self.overlay.read();
        let mut tx = DBTransaction::new();
        for (key, value) in overlay.iter() {
            match value {
                Some(value) => tx.put(COL, key, value),
                None => tx.delete(COL, key),
            }
        }
        tx
    }

    pub(crate) fn commit(&self, tx: DBTransaction) -> Result<()> {
        self.db.write(tx)?;
        self.overlay.write().clear();
        trace!("store {} committed", self.name);
        Ok(())
    }

    pub(crate) fn abort(&self) {
        let dropped = {
            let mut overlay = self.overlay.write();
            let n = overlay.len();
            overlay.clear();
            n
        };
        if dropped > 0 {
            warn!("store {} aborted {} staged entries", self.name, dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Store {
        Store::new(Arc::new(kvdb_memorydb::create(1)), "test")
    }

    #[test]
    fn overlay_reads_before_commit() {
        let store = memory_store();
        let mut batch = StoreBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        store.write(batch);
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.abort();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn commit_persists_and_clears_overlay() {
        let store = memory_store();
        let mut batch = StoreBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"ab".to_vec(), b"2".to_vec());
        store.write(batch);
        let tx = store.prepare();
        store.commit(tx).unwrap();

        // An abort after commit must not lose committed data.
        store.abort();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        let entries = store.iter_with_prefix(b"a").unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn overlay_deletion_shadows_database() {
        let store = memory_store();
        let mut batch = StoreBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        store.write(batch);
        store.commit(store.prepare()).unwrap();

        let mut batch = StoreBatch::new();
        batch.delete(b"k".to_vec());
        store.write(batch);
        assert_eq!(store.get(b"k").unwrap(), None);
        assert!(store.iter_with_prefix(b"k").unwrap().is_empty());
    }
}

// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::store::Store;
use lattice_db_errors::storage::Result;
use parking_lot::RwLock;
use std::sync::Arc;

/// Durability coordinator for the independently-opened stores. Holds the
/// write side of the flush lock, so a flush never interleaves with an
/// in-flight ingestion (which holds the read side).
pub struct Flusher {
    stores: Vec<Arc<Store>>,
    flush_lock: Arc<RwLock<()>>,
}

impl Flusher {
    pub fn new(stores: Vec<Arc<Store>>, flush_lock: Arc<RwLock<()>>) -> Self {
        Flusher { stores, flush_lock }
    }

    /// Commits every store's staged overlay as one checkpoint. All prepare
    /// steps run before the first commit, so a failure while preparing
    /// leaves the databases untouched.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.write();
        let txs: Vec<_> =
            self.stores.iter().map(|store| store.prepare()).collect();
        for (store, tx) in self.stores.iter().zip(txs) {
            store.commit(tx)?;
        }
        debug!("flusher committed {} stores", self.stores.len());
        Ok(())
    }

    /// Drops everything staged since the last commit point. Called when an
    /// insertion panics mid-way so a half-written chunk never persists.
    pub fn abort(&self) {
        for store in &self.stores {
            store.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreBatch;

    #[test]
    fn abort_drops_all_staged_stores() {
        let lock = Arc::new(RwLock::new(()));
        let a = Arc::new(Store::new(
            Arc::new(kvdb_memorydb::create(1)),
            "a",
        ));
        let b = Arc::new(Store::new(
            Arc::new(kvdb_memorydb::create(1)),
            "b",
        ));
        let flusher = Flusher::new(vec![a.clone(), b.clone()], lock);

        let mut batch = StoreBatch::new();
        batch.put(b"x".to_vec(), b"1".to_vec());
        a.write(batch);
        let mut batch = StoreBatch::new();
        batch.put(b"y".to_vec(), b"2".to_vec());
        b.write(batch);

        flusher.abort();
        assert_eq!(a.get(b"x").unwrap(), None);
        assert_eq!(b.get(b"y").unwrap(), None);
    }

    #[test]
    fn flush_commits_every_store() {
        let lock = Arc::new(RwLock::new(()));
        let a = Arc::new(Store::new(
            Arc::new(kvdb_memorydb::create(1)),
            "a",
        ));
        let flusher = Flusher::new(vec![a.clone()], lock);

        let mut batch = StoreBatch::new();
        batch.put(b"x".to_vec(), b"1".to_vec());
        a.write(batch);
        flusher.flush().unwrap();
        flusher.abort();
        assert_eq!(a.get(b"x").unwrap(), Some(b"1".to_vec()));
    }
}

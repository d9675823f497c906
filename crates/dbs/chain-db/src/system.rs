// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::store::Store;
use kvdb::KeyValueDB;
use kvdb_rocksdb::{Database, DatabaseConfig};
use lattice_db_errors::storage::Result;
use std::{path::Path, sync::Arc};

/// The three independently-opened column stores backing the node, each with
/// its own batch/flush cycle.
pub struct SystemStores {
    pub blocks: Arc<Store>,
    pub index: Arc<Store>,
    pub state: Arc<Store>,
}

impl SystemStores {
    /// Opens (or creates) the on-disk databases under `base_dir`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        Ok(SystemStores {
            blocks: Arc::new(Store::new(
                open_rocksdb(&base_dir.join("blocks"))?,
                "blocks",
            )),
            index: Arc::new(Store::new(
                open_rocksdb(&base_dir.join("index"))?,
                "index",
            )),
            state: Arc::new(Store::new(
                open_rocksdb(&base_dir.join("state"))?,
                "state",
            )),
        })
    }

    pub fn all(&self) -> Vec<Arc<Store>> {
        vec![self.blocks.clone(), self.index.clone(), self.state.clone()]
    }
}

fn open_rocksdb(path: &Path) -> Result<Arc<dyn KeyValueDB>> {
    let config = DatabaseConfig::with_columns(1);
    let db = Database::open(&config, path)?;
    info!("opened rocksdb store at {}", path.display());
    Ok(Arc::new(db))
}

// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! The two chain-side storage layers: the append-only block log returning
//! opaque byte locations, and the secondary-index database resolving hashes,
//! heights, send/receive pairings and on-road pending lists.

#[macro_use]
extern crate log;

mod block_db;
mod flusher;
pub mod index_db;
mod store;
mod system;

pub use block_db::{BlockDb, Location};
pub use flusher::Flusher;
pub use index_db::IndexDb;
pub use store::{Store, StoreBatch};
pub use system::SystemStores;

pub use lattice_db_errors::storage::{Error, Result};

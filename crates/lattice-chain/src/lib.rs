// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! The chain ingestion engine: atomically applies account blocks and
//! snapshot blocks across the block log, the index database and the state
//! database, maintains the hot unconfirmed cache, and rolls back
//! unconfirmed work invalidated by a snapshot.

#[macro_use]
extern crate log;

mod cache;
mod chain;
mod error;
mod event;
pub mod plugins;

pub use cache::ChainCache;
pub use chain::{Chain, ChainConfig, ChainReader};
pub use error::{ChainError, Result};
pub use event::ChainListener;

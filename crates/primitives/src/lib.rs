// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Ledger primitives: account blocks forming per-address hash chains and
//! snapshot blocks naming the confirmed head of each chain.

pub mod account_block;
pub mod error;
pub mod snapshot_block;

pub use account_block::{AccountBlock, BlockType};
pub use error::BlockError;
pub use snapshot_block::{
    snapshot_content_hash, SnapshotBlock, SnapshotChunk, SnapshotContent,
};

pub type Bytes = Vec<u8>;

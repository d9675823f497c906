// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use lattice_types::Hash;
use thiserror::Error;

/// Errors concerning block validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("unknown block type: {0}")]
    UnknownBlockType(u8),

    #[error("invalid block hash: expected {expected:?}, got {got:?}")]
    InvalidHash { expected: Hash, got: Hash },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid block height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },

    #[error("invalid prev hash: expected {expected:?}, got {got:?}")]
    InvalidPrevHash { expected: Hash, got: Hash },

    #[error("referenced send block not found: {0:?}")]
    UnknownFromBlock(Hash),

    #[error("send already received by {0:?}")]
    SendAlreadyReceived(Hash),

    #[error("amount must not be zero")]
    ZeroAmount,

    #[error("token mismatch")]
    TokenMismatch,
}

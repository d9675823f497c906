// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use lattice_types::Hash;
use primitives::BlockError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Storage(#[from] lattice_db_errors::storage::Error),

    #[error(transparent)]
    State(#[from] lattice_db_errors::statedb::Error),

    /// The snapshot names a head the unconfirmed set cannot reach.
    #[error("lack block: snapshot {snapshot:?} names unreachable heads: {detail}")]
    LackBlock { snapshot: Hash, detail: String },

    #[error("prepare listener rejected insertion: {0}")]
    Listener(String),

    #[error("{0}")]
    Msg(String),

    #[error(transparent)]
    Rlp(#[from] rlp::DecoderError),
}

pub type Result<T> = std::result::Result<T, ChainError>;

impl From<String> for ChainError {
    fn from(e: String) -> Self { ChainError::Msg(e) }
}

impl From<&str> for ChainError {
    fn from(e: &str) -> Self { ChainError::Msg(e.into()) }
}

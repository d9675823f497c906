// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! The versioned per-contract key/value state database (C3). `StateDb` owns
//! the committed state; a `VmDb` handle scopes one block execution and
//! buffers its delta until the chain engine accepts the block.

#[macro_use]
extern crate log;

mod statedb;
#[cfg(test)]
mod tests;
mod vm_db;

pub use statedb::StateDb;
pub use vm_db::{VmAccountBlock, VmDb, VmDbContext, VmLog};

pub use lattice_db_errors::statedb::{Error, Result};

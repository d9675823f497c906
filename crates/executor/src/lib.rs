// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! The virtual machine (C6) and the built-in contract family (C7): executes
//! send/receive pairs against a `VmDb`, computes quota, performs refunds,
//! enforces call depth, and dispatches built-in contract methods by 4-byte
//! selector.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod abi;
pub mod builtin;
mod env;
mod error;
pub mod quota;
mod vm;

pub use env::{ConsensusReader, FixedPeriodReader, VmEnv};
pub use error::{VmError, VmResult};
pub use vm::{
    can_transfer, make_create_data, make_send_block, new_contract_address,
    ReceiveOutcome, RetryReason, Vm, VmConfig, VmOutput, RESULT_DEPTH,
    RESULT_FAIL, RESULT_SUCCESS,
};

// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    // Quota
    #[error("out of quota")]
    OutOfQuota,
    #[error("intrinsic gas exceeds quota")]
    IntrinsicGas,

    // State
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    #[error("exceed fund available")]
    ExceedFundAvailable,
    #[error("exceed fund locked")]
    ExceedFundLocked,
    #[error("exceed pledge available")]
    ExceedPledgeAvailable,

    // Call semantics
    #[error("call depth limit reached")]
    Depth,
    #[error("invalid source address for callback")]
    InvalidSourceAddress,
    #[error("method not found")]
    MethodNotFound,
    #[error("invalid method param: {0}")]
    InvalidMethodParam(String),

    // Structural
    #[error("address collision on create")]
    AddressCollision,
    #[error("chain forked: referenced block not found")]
    ChainForked,
    #[error("transaction type not supported")]
    InvalidBlockType,

    // Create validation
    #[error("invalid contract type")]
    InvalidContractType,
    #[error("invalid confirm time")]
    InvalidConfirmTime,
    #[error("contract code size limit exceeded")]
    CodeSizeLimit,

    // Built-in contract rejections
    #[error("token not found")]
    TokenNotExists,
    #[error("trade market not exists")]
    MarketNotExists,
    #[error("trade market stopped")]
    MarketStopped,
    #[error("trade market invalid token pair")]
    InvalidTokenPair,
    #[error("order amount too small")]
    OrderAmountTooSmall,
    #[error("invalid order type")]
    InvalidOrderType,
    #[error("invalid order price")]
    InvalidOrderPrice,
    #[error("invalid order quantity")]
    InvalidOrderQuantity,
    #[error("pledge for vip already exists")]
    PledgeForVipExists,
    #[error("pledge for vip not exists")]
    PledgeForVipNotExists,
    #[error("pledge for vip not expired")]
    PledgeForVipNotExpire,
    #[error("contract method rejected: {0}")]
    Contract(String),

    #[error("execution aborted")]
    Aborted,

    #[error("state database error: {0}")]
    State(String),
}

impl From<lattice_db_errors::statedb::Error> for VmError {
    fn from(e: lattice_db_errors::statedb::Error) -> Self {
        match e {
            lattice_db_errors::statedb::Error::InsufficientBalance {
                ..
            } => VmError::InsufficientBalance,
            other => VmError::State(other.to_string()),
        }
    }
}

pub type VmResult<T> = std::result::Result<T, VmError>;

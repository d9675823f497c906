// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Quota accounting: per-block budgets funded by pledged stake plus
//! optional PoW difficulty, and the intrinsic costs charged up front.

use crate::{
    builtin::pledge::pledged_quota_amount,
    error::{VmError, VmResult},
    vm::VmConfig,
};
use lattice_statedb::VmDb;
use lattice_types::U256;

pub const QUOTA_FOR_TEST: u64 = 1_000_000;

/// One quota unit per this much pledged stake.
pub const PLEDGE_AMOUNT_PER_QUOTA: u64 = 10_000;
/// One additional quota unit per this much PoW difficulty.
pub const DIFFICULTY_PER_QUOTA: u64 = 1_000;
pub const MAX_QUOTA_PER_BLOCK: u64 = 1_000_000;
pub const MAX_QUOTA_ADDITION: u64 = 100_000;

pub const INTRINSIC_GAS: u64 = 21_000;
pub const INTRINSIC_CREATE_GAS: u64 = 53_000;
pub const DATA_GAS_PER_BYTE: u64 = 68;
/// Create payloads carry whole contracts; bytes are charged at a reduced
/// rate so a contract at the size cap stays within the per-block quota.
pub const CREATE_DATA_GAS_PER_BYTE: u64 = 8;
pub const CODE_GAS_PER_BYTE: u64 = 200;
/// Stand-in execution charge per byte of stored contract code.
pub const EXEC_GAS_PER_CODE_BYTE: u64 = 40;
/// Create quota granted per unit of creation fee.
pub const CREATE_FEE_PER_QUOTA: u64 = 2_000;
/// Ceiling on fee-funded create quota. Must cover the create intrinsic
/// gas plus per-byte code cost for a contract at the size cap.
pub const MAX_CREATE_QUOTA: u64 = 5_000_000;

/// Total quota and PoW addition available to a block: pledge-funded budget
/// plus a difficulty top-up.
pub fn calc_quota(
    config: &VmConfig, db: &VmDb, difficulty: Option<U256>,
) -> VmResult<(u64, u64)> {
    if config.is_test {
        return Ok((QUOTA_FOR_TEST, 0));
    }
    let pledged = pledged_quota_amount(db, db.address())?;
    let total = (pledged / U256::from(PLEDGE_AMOUNT_PER_QUOTA))
        .min(U256::from(MAX_QUOTA_PER_BLOCK))
        .as_u64();
    let addition = match difficulty {
        Some(difficulty) => (difficulty
            / U256::from(DIFFICULTY_PER_QUOTA))
        .min(U256::from(MAX_QUOTA_ADDITION))
        .as_u64(),
        None => 0,
    };
    Ok((total + addition, addition))
}

/// Quota granted to a contract-create receive, funded by the creation fee.
pub fn calc_create_quota(fee: U256) -> u64 {
    (fee / U256::from(CREATE_FEE_PER_QUOTA))
        .min(U256::from(MAX_CREATE_QUOTA))
        .as_u64()
}

pub fn intrinsic_gas_cost(data: &[u8], is_create: bool) -> VmResult<u64> {
    let (base, per_byte) = if is_create {
        (INTRINSIC_CREATE_GAS, CREATE_DATA_GAS_PER_BYTE)
    } else {
        (INTRINSIC_GAS, DATA_GAS_PER_BYTE)
    };
    (data.len() as u64)
        .checked_mul(per_byte)
        .and_then(|data_gas| base.checked_add(data_gas))
        .ok_or(VmError::IntrinsicGas)
}

pub fn use_quota(quota_left: u64, cost: u64) -> VmResult<u64> {
    quota_left.checked_sub(cost).ok_or(VmError::OutOfQuota)
}

/// Quota recorded on the block. Failed executions that ran out of quota
/// consume the whole pledge-funded budget; the PoW addition is never
/// recorded as consumed.
pub fn quota_used(
    use_quota: bool, quota_total: u64, quota_addition: u64, quota_left: u64,
    quota_refund: u64, error: Option<&VmError>,
) -> u64 {
    if !use_quota {
        return 0;
    }
    match error {
        Some(VmError::OutOfQuota) => quota_total - quota_addition,
        Some(_) => 0,
        None => {
            let used = quota_total - quota_addition - quota_left.min(quota_total - quota_addition);
            used - quota_refund.min(used / 2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsic_cost_scales_with_data() {
        let empty = intrinsic_gas_cost(&[], false).unwrap();
        assert_eq!(empty, INTRINSIC_GAS);
        let with_data = intrinsic_gas_cost(&[0u8; 10], false).unwrap();
        assert_eq!(with_data, INTRINSIC_GAS + 10 * DATA_GAS_PER_BYTE);
        assert_eq!(
            intrinsic_gas_cost(&[0u8; 10], true).unwrap(),
            INTRINSIC_CREATE_GAS + 10 * CREATE_DATA_GAS_PER_BYTE
        );
    }

    #[test]
    fn use_quota_fails_when_exhausted() {
        assert_eq!(use_quota(100, 40).unwrap(), 60);
        assert_eq!(use_quota(39, 40), Err(VmError::OutOfQuota));
    }

    #[test]
    fn default_create_fee_funds_a_contract_at_the_size_cap() {
        let config = crate::vm::VmConfig::default();
        let quota = calc_create_quota(config.create_contract_fee);
        let max_cost = INTRINSIC_CREATE_GAS
            + config.max_code_size as u64 * CODE_GAS_PER_BYTE;
        assert!(quota >= max_cost, "create quota {} < {}", quota, max_cost);
        // The send side of a cap-sized create must fit a block's quota too.
        let send_cost =
            intrinsic_gas_cost(&vec![0u8; config.max_code_size + 2], true)
                .unwrap();
        assert!(send_cost <= MAX_QUOTA_PER_BLOCK);
    }

    #[test]
    fn quota_used_charges_full_budget_on_out_of_quota() {
        assert_eq!(
            quota_used(true, 1000, 100, 0, 0, Some(&VmError::OutOfQuota)),
            900
        );
        assert_eq!(quota_used(false, 1000, 100, 0, 0, None), 0);
        assert_eq!(quota_used(true, 1000, 0, 400, 0, None), 600);
        // Refund is capped at half of the consumption.
        assert_eq!(quota_used(true, 1000, 0, 400, 500, None), 300);
    }
}

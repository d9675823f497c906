// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Quota staking: lock native tokens for a beneficiary to fund its quota.
//! Contracts may stake on behalf of users through the agent methods, which
//! complete via callback sends to the requesting contract.

use super::{dex, BuiltinContractMethod, PLEDGE_CONTRACT_ADDRESS};
use crate::{
    abi,
    env::VmEnv,
    error::{VmError, VmResult},
    vm::make_send_block,
};
use lattice_statedb::VmDb;
use lattice_types::{Address, U256, NATIVE_TOKEN_ID};
use primitives::{AccountBlock, BlockType};
use rlp_derive::{RlpDecodable, RlpEncodable};
use std::{collections::HashMap, sync::Arc};

pub const SIG_PLEDGE: &str = "Pledge(address)";
pub const SIG_CANCEL_PLEDGE: &str = "CancelPledge(address,uint256)";
pub const SIG_AGENT_PLEDGE: &str = "AgentPledge(address,address,uint8)";
pub const SIG_AGENT_CANCEL_PLEDGE: &str =
    "AgentCancelPledge(address,address,uint256,uint8)";

const PLEDGE_GAS: u64 = 82_000;
const CANCEL_PLEDGE_GAS: u64 = 73_000;

/// Heights a pledge stays locked after creation.
pub const PLEDGE_LOCK_HEIGHTS: u64 = 259_200;
pub const PLEDGE_MIN_AMOUNT: u64 = 134;

#[derive(RlpEncodable, RlpDecodable)]
pub struct PledgeParams {
    pub beneficiary: Address,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct CancelPledgeParams {
    pub beneficiary: Address,
    pub amount: U256,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct AgentPledgeParams {
    pub pledge_addr: Address,
    pub beneficiary: Address,
    pub bid: u8,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct AgentCancelPledgeParams {
    pub pledge_addr: Address,
    pub beneficiary: Address,
    pub amount: U256,
    pub bid: u8,
}

#[derive(RlpEncodable, RlpDecodable, Default)]
struct PledgeInfo {
    amount: U256,
    withdraw_height: u64,
    is_agent: bool,
    agent: Address,
}

fn beneficial_key(beneficiary: &Address) -> Vec<u8> {
    let mut key = b"b:".to_vec();
    key.extend_from_slice(beneficiary.as_bytes());
    key
}

fn pledge_key(pledge_addr: &Address, beneficiary: &Address) -> Vec<u8> {
    let mut key = b"p:".to_vec();
    key.extend_from_slice(pledge_addr.as_bytes());
    key.extend_from_slice(beneficiary.as_bytes());
    key
}

/// Total stake pledged toward `addr`'s quota. Read by the quota
/// calculation for every block `addr` produces.
pub fn pledged_quota_amount(db: &VmDb, addr: &Address) -> VmResult<U256> {
    let raw =
        db.get_storage_at(&PLEDGE_CONTRACT_ADDRESS, &beneficial_key(addr))?;
    match raw {
        None => Ok(U256::zero()),
        Some(raw) => rlp::decode(&raw)
            .map_err(|e| VmError::State(e.to_string())),
    }
}

fn read_beneficial(db: &VmDb, beneficiary: &Address) -> VmResult<U256> {
    match db.get_storage(&beneficial_key(beneficiary))? {
        None => Ok(U256::zero()),
        Some(raw) => {
            rlp::decode(&raw).map_err(|e| VmError::State(e.to_string()))
        }
    }
}

fn write_beneficial(db: &mut VmDb, beneficiary: &Address, amount: U256) {
    let key = beneficial_key(beneficiary);
    if amount.is_zero() {
        db.delete_storage(key);
    } else {
        db.set_storage(key, rlp::encode(&amount).to_vec());
    }
}

fn read_pledge(
    db: &VmDb, pledge_addr: &Address, beneficiary: &Address,
) -> VmResult<Option<PledgeInfo>> {
    match db.get_storage(&pledge_key(pledge_addr, beneficiary))? {
        None => Ok(None),
        Some(raw) => rlp::decode(&raw)
            .map(Some)
            .map_err(|e| VmError::State(e.to_string())),
    }
}

fn apply_pledge(
    db: &mut VmDb, pledge_addr: &Address, beneficiary: &Address,
    amount: U256, agent: Option<Address>, snapshot_height: u64,
) -> VmResult<()> {
    let mut info = read_pledge(db, pledge_addr, beneficiary)?
        .unwrap_or_default();
    info.amount = info.amount + amount;
    info.withdraw_height = snapshot_height + PLEDGE_LOCK_HEIGHTS;
    if let Some(agent) = agent {
        info.is_agent = true;
        info.agent = agent;
    }
    db.set_storage(
        pledge_key(pledge_addr, beneficiary),
        rlp::encode(&info).to_vec(),
    );
    let beneficial = read_beneficial(db, beneficiary)? + amount;
    write_beneficial(db, beneficiary, beneficial);
    Ok(())
}

fn apply_cancel(
    db: &mut VmDb, pledge_addr: &Address, beneficiary: &Address,
    amount: U256, expect_agent: Option<&Address>, snapshot_height: u64,
) -> VmResult<()> {
    let mut info = read_pledge(db, pledge_addr, beneficiary)?
        .ok_or(VmError::ExceedPledgeAvailable)?;
    match expect_agent {
        Some(agent) if !info.is_agent || info.agent != *agent => {
            return Err(VmError::InvalidSourceAddress)
        }
        None if info.is_agent => return Err(VmError::InvalidSourceAddress),
        _ => {}
    }
    if info.withdraw_height > snapshot_height {
        return Err(VmError::ExceedPledgeAvailable);
    }
    if info.amount < amount {
        return Err(VmError::ExceedPledgeAvailable);
    }
    info.amount = info.amount - amount;
    let key = pledge_key(pledge_addr, beneficiary);
    if info.amount.is_zero() {
        db.delete_storage(key);
    } else {
        db.set_storage(key, rlp::encode(&info).to_vec());
    }
    let beneficial = read_beneficial(db, beneficiary)?;
    if beneficial < amount {
        return Err(VmError::ExceedPledgeAvailable);
    }
    write_beneficial(db, beneficiary, beneficial - amount);
    Ok(())
}

struct MethodPledge;

impl BuiltinContractMethod for MethodPledge {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(PLEDGE_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<PledgeParams>(&block.data)?;
        if block.token_id != NATIVE_TOKEN_ID
            || block.amount < U256::from(PLEDGE_MIN_AMOUNT)
        {
            return Err(VmError::InvalidMethodParam(
                "pledge amount below minimum or wrong token".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params = abi::decode_params::<PledgeParams>(&send_block.data)?;
        let snapshot_height = db.latest_snapshot().height;
        apply_pledge(
            db,
            &send_block.account_address,
            &params.beneficiary,
            send_block.amount,
            None,
            snapshot_height,
        )?;
        Ok(Vec::new())
    }

    fn refund_data(&self, _send_block: &AccountBlock) -> (Vec<u8>, bool) {
        (vec![1], true)
    }
}

struct MethodCancelPledge;

impl BuiltinContractMethod for MethodCancelPledge {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(CANCEL_PLEDGE_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params =
            abi::decode_params::<CancelPledgeParams>(&block.data)?;
        if !block.amount.is_zero() || params.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "cancel pledge carries no amount".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<CancelPledgeParams>(&send_block.data)?;
        let snapshot_height = db.latest_snapshot().height;
        apply_cancel(
            db,
            &send_block.account_address,
            &params.beneficiary,
            params.amount,
            None,
            snapshot_height,
        )?;
        // Return the unlocked stake.
        Ok(vec![make_send_block(
            block.account_address,
            send_block.account_address,
            BlockType::SendCall,
            params.amount,
            NATIVE_TOKEN_ID,
            Vec::new(),
        )])
    }
}

struct MethodAgentPledge;

impl BuiltinContractMethod for MethodAgentPledge {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(PLEDGE_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<AgentPledgeParams>(&block.data)?;
        if !block.account_address.is_contract() {
            return Err(VmError::InvalidSourceAddress);
        }
        if block.token_id != NATIVE_TOKEN_ID || block.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "agent pledge needs a native-token amount".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<AgentPledgeParams>(&send_block.data)?;
        let agent = send_block.account_address;
        let snapshot_height = db.latest_snapshot().height;
        apply_pledge(
            db,
            &params.pledge_addr,
            &params.beneficiary,
            send_block.amount,
            Some(agent),
            snapshot_height,
        )?;
        Ok(vec![make_send_block(
            block.account_address,
            agent,
            BlockType::SendCall,
            U256::zero(),
            NATIVE_TOKEN_ID,
            pledge_callback_data(
                &params.pledge_addr,
                params.bid,
                true,
                send_block.amount,
            ),
        )])
    }

    fn refund_data(&self, send_block: &AccountBlock) -> (Vec<u8>, bool) {
        match abi::decode_params::<AgentPledgeParams>(&send_block.data) {
            Ok(params) => (
                pledge_callback_data(
                    &params.pledge_addr,
                    params.bid,
                    false,
                    send_block.amount,
                ),
                true,
            ),
            Err(_) => (Vec::new(), true),
        }
    }
}

struct MethodAgentCancelPledge;

impl BuiltinContractMethod for MethodAgentCancelPledge {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(CANCEL_PLEDGE_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params =
            abi::decode_params::<AgentCancelPledgeParams>(&block.data)?;
        if !block.account_address.is_contract() {
            return Err(VmError::InvalidSourceAddress);
        }
        if params.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "agent cancel needs an amount".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<AgentCancelPledgeParams>(&send_block.data)?;
        let agent = send_block.account_address;
        let snapshot_height = db.latest_snapshot().height;
        apply_cancel(
            db,
            &params.pledge_addr,
            &params.beneficiary,
            params.amount,
            Some(&agent),
            snapshot_height,
        )?;
        // The unlocked stake travels back with the callback.
        Ok(vec![make_send_block(
            block.account_address,
            agent,
            BlockType::SendCall,
            params.amount,
            NATIVE_TOKEN_ID,
            cancel_pledge_callback_data(
                &params.pledge_addr,
                params.bid,
                true,
                params.amount,
            ),
        )])
    }

    fn refund_data(&self, send_block: &AccountBlock) -> (Vec<u8>, bool) {
        match abi::decode_params::<AgentCancelPledgeParams>(&send_block.data)
        {
            Ok(params) => (
                cancel_pledge_callback_data(
                    &params.pledge_addr,
                    params.bid,
                    false,
                    params.amount,
                ),
                true,
            ),
            Err(_) => (Vec::new(), true),
        }
    }
}

fn pledge_callback_data(
    pledge_addr: &Address, bid: u8, success: bool, amount: U256,
) -> Vec<u8> {
    abi::encode_call(
        abi::method_selector(dex::fund::SIG_PLEDGE_CALLBACK),
        &dex::fund::PledgeCallbackParams {
            pledge_addr: *pledge_addr,
            bid,
            success,
            amount,
        },
    )
}

fn cancel_pledge_callback_data(
    pledge_addr: &Address, bid: u8, success: bool, amount: U256,
) -> Vec<u8> {
    abi::encode_call(
        abi::method_selector(dex::fund::SIG_CANCEL_PLEDGE_CALLBACK),
        &dex::fund::PledgeCallbackParams {
            pledge_addr: *pledge_addr,
            bid,
            success,
            amount,
        },
    )
}

pub fn method_table() -> HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> {
    let mut table: HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> =
        HashMap::new();
    table.insert(abi::method_selector(SIG_PLEDGE), Arc::new(MethodPledge));
    table.insert(
        abi::method_selector(SIG_CANCEL_PLEDGE),
        Arc::new(MethodCancelPledge),
    );
    table.insert(
        abi::method_selector(SIG_AGENT_PLEDGE),
        Arc::new(MethodAgentPledge),
    );
    table.insert(
        abi::method_selector(SIG_AGENT_CANCEL_PLEDGE),
        Arc::new(MethodAgentCancelPledge),
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::DEX_FUND_CONTRACT_ADDRESS;

    #[test]
    fn callback_data_targets_dex_fund_selector() {
        let data = pledge_callback_data(
            &DEX_FUND_CONTRACT_ADDRESS,
            1,
            true,
            U256::from(10),
        );
        assert_eq!(
            abi::selector_of(&data).unwrap(),
            abi::method_selector(dex::fund::SIG_PLEDGE_CALLBACK)
        );
        let params: dex::fund::PledgeCallbackParams =
            abi::decode_params(&data).unwrap();
        assert!(params.success);
        assert_eq!(params.amount, U256::from(10));
    }
}

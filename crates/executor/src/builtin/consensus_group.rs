// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Producer registration for the snapshot consensus group: register a node
//! under a name with locked stake, rotate the node address, cancel after
//! the lock expires, and draw period rewards against the consensus oracle.

use super::BuiltinContractMethod;
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

pub const SIG_REGISTER: &str = "Register(string,address)";
pub const SIG_CANCEL_REGISTER: &str = "CancelRegister(string)";
pub const SIG_UPDATE_REGISTRATION: &str = "UpdateRegistration(string,address)";
pub const SIG_REWARD: &str = "Reward(string,uint64,address)";

const REGISTER_GAS: u64 = 62_200;
const CANCEL_REGISTER_GAS: u64 = 83_200;
const UPDATE_REGISTRATION_GAS: u64 = 62_200;
const REWARD_GAS: u64 = 68_200;

pub const REGISTER_PLEDGE_AMOUNT: u64 = 1_000_000;
pub const REGISTER_LOCK_HEIGHTS: u64 = 7_776_000;
pub const REWARD_PER_PERIOD: u64 = 951_000;

/// A super-node registration. Active while it has stake and has not been
/// cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub node_addr: Address,
    pub pledge_addr: Address,
    pub amount: U256,
    pub withdraw_height: u64,
    pub reward_index: u64,
    pub cancel_height: u64,
    pub his_addr_list: Vec<Address>,
}

impl rlp::Encodable for Registration {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(8)
            .append(&self.name)
            .append(&self.node_addr)
            .append(&self.pledge_addr)
            .append(&self.amount)
            .append(&self.withdraw_height)
            .append(&self.reward_index)
            .append(&self.cancel_height)
            .append_list(&self.his_addr_list);
    }
}

impl rlp::Decodable for Registration {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(Registration {
            name: rlp.val_at(0)?,
            node_addr: rlp.val_at(1)?,
            pledge_addr: rlp.val_at(2)?,
            amount: rlp.val_at(3)?,
            withdraw_height: rlp.val_at(4)?,
            reward_index: rlp.val_at(5)?,
            cancel_height: rlp.val_at(6)?,
            his_addr_list: rlp.list_at(7)?,
        })
    }
}

impl Registration {
    pub fn is_active(&self) -> bool {
        self.cancel_height == 0 && !self.amount.is_zero()
    }
}

/// Policy object deciding what a valid (cancel-)registration looks like.
/// The production group uses fixed stake and lock period; other groups can
/// register different conditions under their own id.
pub trait RegisterCondition: Send + Sync {
    fn check_register(
        &self, amount: U256, token: &lattice_types::TokenId,
    ) -> bool;

    fn withdraw_height(&self, current_height: u64) -> u64;
}

struct StakingCondition;

impl RegisterCondition for StakingCondition {
    fn check_register(
        &self, amount: U256, token: &lattice_types::TokenId,
    ) -> bool {
        *token == NATIVE_TOKEN_ID
            && amount == U256::from(REGISTER_PLEDGE_AMOUNT)
    }

    fn withdraw_height(&self, current_height: u64) -> u64 {
        current_height + REGISTER_LOCK_HEIGHTS
    }
}

pub const STAKING_CONDITION_ID: u8 = 1;

fn condition_for(id: u8) -> Option<Box<dyn RegisterCondition>> {
    match id {
        STAKING_CONDITION_ID => Some(Box::new(StakingCondition)),
        _ => None,
    }
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct RegisterParams {
    pub name: String,
    pub node_addr: Address,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct CancelRegisterParams {
    pub name: String,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct RewardParams {
    pub name: String,
    pub end_index: u64,
    pub receiver: Address,
}

fn register_key(name: &str) -> Vec<u8> {
    let mut key = b"r:".to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

fn his_name_key(node_addr: &Address) -> Vec<u8> {
    let mut key = b"h:".to_vec();
    key.extend_from_slice(node_addr.as_bytes());
    key
}

pub fn read_registration(
    db: &VmDb, name: &str,
) -> VmResult<Option<Registration>> {
    match db.get_storage(&register_key(name))? {
        None => Ok(None),
        Some(raw) => rlp::decode(&raw)
            .map(Some)
            .map_err(|e| VmError::State(e.to_string())),
    }
}

fn write_registration(db: &mut VmDb, registration: &Registration) {
    db.set_storage(
        register_key(&registration.name),
        rlp::encode(registration).to_vec(),
    );
}

fn check_name(name: &str) -> VmResult<()> {
    if name.is_empty() || name.len() > 40 {
        return Err(VmError::InvalidMethodParam(
            "registration name length".into(),
        ));
    }
    Ok(())
}

struct MethodRegister;

impl BuiltinContractMethod for MethodRegister {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(REGISTER_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<RegisterParams>(&block.data)?;
        check_name(&params.name)?;
        let condition = condition_for(STAKING_CONDITION_ID)
            .ok_or_else(|| VmError::Contract(
                "register condition id not exist".into(),
            ))?;
        if !condition.check_register(block.amount, &block.token_id) {
            return Err(VmError::Contract(
                "register condition not match".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params = abi::decode_params::<RegisterParams>(&send_block.data)?;
        let snapshot = db.latest_snapshot();

        let mut his_addr_list = Vec::new();
        if let Some(old) = read_registration(db, &params.name)? {
            // Only an expired registration owned by the same staker can be
            // replaced.
            if old.is_active() || old.pledge_addr != send_block.account_address
            {
                return Err(VmError::Contract("register data exist".into()));
            }
            his_addr_list = old.his_addr_list;
        }

        let his_key = his_name_key(&params.node_addr);
        match db.get_storage(&his_key)? {
            Some(raw) => {
                let registered: String = rlp::decode(&raw)
                    .map_err(|e| VmError::State(e.to_string()))?;
                if registered != params.name {
                    return Err(VmError::Contract(
                        "node address is registered to another name".into(),
                    ));
                }
            }
            None => {
                his_addr_list.push(params.node_addr);
                db.set_storage(his_key, rlp::encode(&params.name).to_vec());
            }
        }

        let condition = condition_for(STAKING_CONDITION_ID)
            .ok_or_else(|| VmError::Contract(
                "register condition id not exist".into(),
            ))?;
        let registration = Registration {
            name: params.name,
            node_addr: params.node_addr,
            pledge_addr: send_block.account_address,
            amount: send_block.amount,
            withdraw_height: condition.withdraw_height(snapshot.height),
            reward_index: env
                .consensus
                .time_to_index(db.snapshot_timestamp()),
            cancel_height: 0,
            his_addr_list,
        };
        write_registration(db, &registration);
        Ok(Vec::new())
    }

    fn refund_data(&self, _send_block: &AccountBlock) -> (Vec<u8>, bool) {
        (vec![1], true)
    }
}

struct MethodCancelRegister;

impl BuiltinContractMethod for MethodCancelRegister {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(CANCEL_REGISTER_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params =
            abi::decode_params::<CancelRegisterParams>(&block.data)?;
        check_name(&params.name)?;
        if !block.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "cancel register carries no amount".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<CancelRegisterParams>(&send_block.data)?;
        let snapshot = db.latest_snapshot();
        let old = read_registration(db, &params.name)?
            .filter(|old| {
                old.is_active()
                    && old.pledge_addr == send_block.account_address
                    && old.withdraw_height <= snapshot.height
            })
            .ok_or_else(|| {
                VmError::Contract("registration status error".into())
            })?;

        let refund_amount = old.amount;
        write_registration(db, &Registration {
            amount: U256::zero(),
            withdraw_height: 0,
            cancel_height: snapshot.height,
            ..old
        });
        if refund_amount.is_zero() {
            return Ok(Vec::new());
        }
        Ok(vec![make_send_block(
            block.account_address,
            send_block.account_address,
            BlockType::SendCall,
            refund_amount,
            NATIVE_TOKEN_ID,
            Vec::new(),
        )])
    }
}

struct MethodUpdateRegistration;

impl BuiltinContractMethod for MethodUpdateRegistration {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(UPDATE_REGISTRATION_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<RegisterParams>(&block.data)?;
        check_name(&params.name)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params = abi::decode_params::<RegisterParams>(&send_block.data)?;
        let mut old = read_registration(db, &params.name)?
            .filter(|old| {
                old.is_active()
                    && old.pledge_addr == send_block.account_address
            })
            .ok_or_else(|| {
                VmError::Contract("registration status error".into())
            })?;
        if old.node_addr == params.node_addr {
            return Err(VmError::Contract("node address unchanged".into()));
        }

        let his_key = his_name_key(&params.node_addr);
        match db.get_storage(&his_key)? {
            Some(raw) => {
                let registered: String = rlp::decode(&raw)
                    .map_err(|e| VmError::State(e.to_string()))?;
                if registered != params.name {
                    return Err(VmError::Contract(
                        "node address is registered to another name".into(),
                    ));
                }
            }
            None => {
                old.his_addr_list.push(params.node_addr);
                db.set_storage(his_key, rlp::encode(&params.name).to_vec());
            }
        }
        old.node_addr = params.node_addr;
        write_registration(db, &old);
        Ok(Vec::new())
    }
}

struct MethodReward;

impl BuiltinContractMethod for MethodReward {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(REWARD_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<RewardParams>(&block.data)?;
        check_name(&params.name)?;
        if !block.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "reward draw carries no amount".into(),
            ));
        }
        Ok(())
    }

    /// Draws the reward for the periods `[reward_index, end_index)`,
    /// emitting a mint send toward the receiver and advancing the index.
    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params = abi::decode_params::<RewardParams>(&send_block.data)?;
        let mut registration = read_registration(db, &params.name)?
            .ok_or_else(|| {
                VmError::Contract("registration status error".into())
            })?;
        if registration.pledge_addr != send_block.account_address {
            return Err(VmError::InvalidSourceAddress);
        }
        let current_index =
            env.consensus.time_to_index(db.snapshot_timestamp());
        if params.end_index <= registration.reward_index
            || params.end_index > current_index
        {
            return Err(VmError::Contract("reward index out of range".into()));
        }
        let periods = params.end_index - registration.reward_index;
        let amount = U256::from(REWARD_PER_PERIOD) * U256::from(periods);
        registration.reward_index = params.end_index;
        write_registration(db, &registration);
        Ok(vec![make_send_block(
            block.account_address,
            params.receiver,
            BlockType::SendReward,
            amount,
            NATIVE_TOKEN_ID,
            Vec::new(),
        )])
    }
}

pub fn method_table() -> HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> {
    let mut table: HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> =
        HashMap::new();
    table
        .insert(abi::method_selector(SIG_REGISTER), Arc::new(MethodRegister));
    table.insert(
        abi::method_selector(SIG_CANCEL_REGISTER),
        Arc::new(MethodCancelRegister),
    );
    table.insert(
        abi::method_selector(SIG_UPDATE_REGISTRATION),
        Arc::new(MethodUpdateRegistration),
    );
    table.insert(abi::method_selector(SIG_REWARD), Arc::new(MethodReward));
    table
}

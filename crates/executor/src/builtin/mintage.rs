// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Token issuance: mint new token ids against a fee, answer token-info
//! queries from other contracts via callback sends, and transfer token
//! ownership.

use super::BuiltinContractMethod;
use crate::{
    abi,
    env::VmEnv,
    error::{VmError, VmResult},
    vm::make_send_block,
};
use lattice_statedb::VmDb;
use lattice_types::{Address, TokenId, U256, NATIVE_TOKEN_ID};
use primitives::{AccountBlock, BlockType};
use rlp_derive::{RlpDecodable, RlpEncodable};
use std::{collections::HashMap, sync::Arc};

pub const SIG_MINT: &str = "Mint(tokenId,string,uint8,uint256)";
pub const SIG_GET_TOKEN_INFO: &str = "GetTokenInfo(tokenId,uint8)";
pub const SIG_TRANSFER_OWNER: &str = "TransferOwner(tokenId,address)";

const MINT_GAS: u64 = 104_525;
const GET_TOKEN_INFO_GAS: u64 = 31_200;
const TRANSFER_OWNER_GAS: u64 = 58_981;

pub const MINT_FEE: u64 = 1_000_000_000;

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
    pub index: u16,
    pub owner: Address,
    pub total_supply: U256,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct MintParams {
    pub token_id: TokenId,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: U256,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct GetTokenInfoParams {
    pub token_id: TokenId,
    pub bid: u8,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct TransferOwnerParams {
    pub token_id: TokenId,
    pub new_owner: Address,
}

fn token_key(token_id: &TokenId) -> Vec<u8> {
    let mut key = b"t:".to_vec();
    key.extend_from_slice(token_id.as_bytes());
    key
}

const KEY_TOKEN_INDEX: &[u8] = b"ti";

pub fn read_token_info(
    db: &VmDb, mintage_addr: &Address, token_id: &TokenId,
) -> VmResult<Option<TokenInfo>> {
    match db.get_storage_at(mintage_addr, &token_key(token_id))? {
        None => Ok(None),
        Some(raw) => rlp::decode(&raw)
            .map(Some)
            .map_err(|e| VmError::State(e.to_string())),
    }
}

fn check_symbol(symbol: &str) -> VmResult<()> {
    let valid = !symbol.is_empty()
        && symbol.len() <= 10
        && symbol
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    if !valid {
        return Err(VmError::InvalidMethodParam("token symbol".into()));
    }
    Ok(())
}

struct MethodMint;

impl BuiltinContractMethod for MethodMint {
    fn fee(&self, _block: &AccountBlock) -> VmResult<U256> {
        Ok(U256::from(MINT_FEE))
    }

    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(MINT_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<MintParams>(&block.data)?;
        check_symbol(&params.symbol)?;
        if params.decimals > 18 {
            return Err(VmError::InvalidMethodParam("token decimals".into()));
        }
        if params.total_supply.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "token total supply".into(),
            ));
        }
        if params.token_id == NATIVE_TOKEN_ID {
            return Err(VmError::InvalidMethodParam(
                "native token id reserved".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params = abi::decode_params::<MintParams>(&send_block.data)?;
        if read_token_info(db, &block.account_address, &params.token_id)?
            .is_some()
        {
            return Err(VmError::Contract("token id already exists".into()));
        }
        let index = match db.get_storage(KEY_TOKEN_INDEX)? {
            None => 0u16,
            Some(raw) => rlp::decode::<u16>(&raw)
                .map_err(|e| VmError::State(e.to_string()))?
                + 1,
        };
        db.set_storage(KEY_TOKEN_INDEX.to_vec(), rlp::encode(&index).to_vec());
        let info = TokenInfo {
            symbol: params.symbol,
            decimals: params.decimals,
            index,
            owner: send_block.account_address,
            total_supply: params.total_supply,
        };
        db.set_storage(token_key(&params.token_id), rlp::encode(&info).to_vec());
        // Issue the full supply to the owner.
        Ok(vec![make_send_block(
            block.account_address,
            send_block.account_address,
            BlockType::SendReward,
            params.total_supply,
            params.token_id,
            Vec::new(),
        )])
    }

    fn refund_data(&self, _send_block: &AccountBlock) -> (Vec<u8>, bool) {
        (vec![1], true)
    }
}

struct MethodGetTokenInfo;

impl BuiltinContractMethod for MethodGetTokenInfo {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(GET_TOKEN_INFO_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<GetTokenInfoParams>(&block.data)?;
        if !block.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "token info query carries no amount".into(),
            ));
        }
        Ok(())
    }

    /// Answers with a callback send to the querying contract; `exist`
    /// distinguishes known from unknown tokens.
    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<GetTokenInfoParams>(&send_block.data)?;
        let info =
            read_token_info(db, &block.account_address, &params.token_id)?;
        let callback = super::dex::fund::TokenInfoCallbackParams {
            token_id: params.token_id,
            bid: params.bid,
            exist: info.is_some(),
            symbol: info
                .as_ref()
                .map(|info| info.symbol.clone())
                .unwrap_or_default(),
            decimals: info.as_ref().map(|info| info.decimals).unwrap_or(0),
            index: info.as_ref().map(|info| info.index).unwrap_or(0),
            owner: info
                .as_ref()
                .map(|info| info.owner)
                .unwrap_or_default(),
        };
        Ok(vec![make_send_block(
            block.account_address,
            send_block.account_address,
            BlockType::SendCall,
            U256::zero(),
            NATIVE_TOKEN_ID,
            abi::encode_call(
                abi::method_selector(
                    super::dex::fund::SIG_GET_TOKEN_INFO_CALLBACK,
                ),
                &callback,
            ),
        )])
    }
}

struct MethodTransferOwner;

impl BuiltinContractMethod for MethodTransferOwner {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(TRANSFER_OWNER_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<TransferOwnerParams>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<TransferOwnerParams>(&send_block.data)?;
        let mut info =
            read_token_info(db, &block.account_address, &params.token_id)?
                .ok_or(VmError::TokenNotExists)?;
        if info.owner != send_block.account_address {
            return Err(VmError::InvalidSourceAddress);
        }
        info.owner = params.new_owner;
        db.set_storage(
            token_key(&params.token_id),
            rlp::encode(&info).to_vec(),
        );
        Ok(Vec::new())
    }
}

pub fn method_table() -> HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> {
    let mut table: HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> =
        HashMap::new();
    table.insert(abi::method_selector(SIG_MINT), Arc::new(MethodMint));
    table.insert(
        abi::method_selector(SIG_GET_TOKEN_INFO),
        Arc::new(MethodGetTokenInfo),
    );
    table.insert(
        abi::method_selector(SIG_TRANSFER_OWNER),
        Arc::new(MethodTransferOwner),
    );
    table
}

// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! DexFund: custodies user exchange balances, locks them for new orders,
//! applies settlements reported by DexTrade, opens markets (asynchronously
//! completing through Mintage token-info callbacks), stages VX/VIP pledges
//! through the Pledge contract, and distributes fee and mined-VX dividends.

use super::state::*;
use crate::{
    abi,
    builtin::{
        mintage, BuiltinContractMethod, DEX_TRADE_CONTRACT_ADDRESS,
        MINTAGE_CONTRACT_ADDRESS, PLEDGE_CONTRACT_ADDRESS,
    },
    env::VmEnv,
    error::{VmError, VmResult},
    vm::make_send_block,
};
use lattice_statedb::VmDb;
use lattice_types::{Address, TokenId, U256, NATIVE_TOKEN_ID};
use primitives::{AccountBlock, BlockType};
use rlp_derive::{RlpDecodable, RlpEncodable};
use std::{collections::HashMap, sync::Arc};

pub const SIG_DEPOSIT: &str = "Deposit()";
pub const SIG_WITHDRAW: &str = "Withdraw(tokenId,uint256)";
pub const SIG_NEW_ORDER: &str =
    "NewOrder(tokenId,tokenId,bool,uint8,uint256,uint256)";
pub const SIG_SETTLE_ORDERS: &str = "SettleOrders(bytes)";
pub const SIG_NEW_MARKET: &str = "NewMarket(tokenId,tokenId)";
pub const SIG_FEE_DIVIDEND: &str = "FeeDividend(uint64)";
pub const SIG_MINED_VX_DIVIDEND: &str = "MinedVxDividend(uint64)";
pub const SIG_PLEDGE_FOR_VX: &str = "PledgeForVx(uint8,uint256)";
pub const SIG_PLEDGE_FOR_VIP: &str = "PledgeForVip(uint8)";
pub const SIG_PLEDGE_CALLBACK: &str =
    "AgentPledgeCallback(address,uint8,bool,uint256)";
pub const SIG_CANCEL_PLEDGE_CALLBACK: &str =
    "AgentCancelPledgeCallback(address,uint8,bool,uint256)";
pub const SIG_GET_TOKEN_INFO_CALLBACK: &str =
    "GetTokenInfoCallback(tokenId,uint8,bool,string,uint8,uint16,address)";
pub const SIG_OWNER_CONFIG: &str = "OwnerConfig(address)";

const DEPOSIT_GAS: u64 = 10_500;
const WITHDRAW_GAS: u64 = 10_500;
const NEW_ORDER_GAS: u64 = 25_500;
const SETTLE_ORDERS_GAS: u64 = 21_000;
const NEW_MARKET_GAS: u64 = 31_500;
const DIVIDEND_GAS: u64 = 31_500;
const PLEDGE_GAS: u64 = 10_500;
const CALLBACK_GAS: u64 = 10_500;

const PLEDGE_ACTION_PLEDGE: u8 = 1;
const PLEDGE_ACTION_CANCEL: u8 = 2;

#[derive(RlpEncodable, RlpDecodable)]
pub struct WithdrawParams {
    pub token: TokenId,
    pub amount: U256,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct NewOrderParams {
    pub trade_token: TokenId,
    pub quote_token: TokenId,
    pub side: bool,
    pub order_type: u8,
    pub price: U256,
    pub quantity: U256,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct NewMarketParams {
    pub trade_token: TokenId,
    pub quote_token: TokenId,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct PeriodParams {
    pub period_id: u64,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct PledgeForVxParams {
    pub action_type: u8,
    pub amount: U256,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct PledgeForVipParams {
    pub action_type: u8,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct PledgeCallbackParams {
    pub pledge_addr: Address,
    pub bid: u8,
    pub success: bool,
    pub amount: U256,
}

#[derive(RlpEncodable, RlpDecodable, Clone)]
pub struct TokenInfoCallbackParams {
    pub token_id: TokenId,
    pub bid: u8,
    pub exist: bool,
    pub symbol: String,
    pub decimals: u8,
    pub index: u16,
    pub owner: Address,
}

#[derive(RlpEncodable, RlpDecodable)]
pub struct OwnerConfigParams {
    pub owner: Address,
}

fn check_owner(db: &VmDb, caller: &Address) -> VmResult<()> {
    match get_owner(db)? {
        Some(owner) if owner == *caller => Ok(()),
        _ => Err(VmError::InvalidSourceAddress),
    }
}

fn dex_token_symbol(info: &DexTokenInfo) -> String {
    format!("{}-{:03}", info.symbol, info.index)
}

fn quote_token_info(db: &VmDb, quote: &TokenId) -> VmResult<DexTokenInfo> {
    if *quote == NATIVE_TOKEN_ID {
        return Ok(DexTokenInfo {
            symbol: "LAT".into(),
            decimals: 18,
            index: 0,
            owner: Address::default(),
        });
    }
    get_dex_token_info(db, quote)?.ok_or(VmError::InvalidTokenPair)
}

struct MethodDeposit;

impl BuiltinContractMethod for MethodDeposit {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(DEPOSIT_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        if block.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "deposit amount is zero".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let mut fund = get_user_fund(db, &send_block.account_address)?;
        let account = fund.account_mut(&send_block.token_id);
        account.available = account.available + send_block.amount;
        save_user_fund(db, &send_block.account_address, &fund);
        Ok(Vec::new())
    }

    fn refund_data(&self, _send_block: &AccountBlock) -> (Vec<u8>, bool) {
        (vec![1], true)
    }
}

struct MethodWithdraw;

impl BuiltinContractMethod for MethodWithdraw {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(WITHDRAW_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<WithdrawParams>(&block.data)?;
        if params.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "withdraw amount is zero".into(),
            ));
        }
        if !block.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "withdraw carries no amount".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params = abi::decode_params::<WithdrawParams>(&send_block.data)?;
        let mut fund = get_user_fund(db, &send_block.account_address)?;
        let account = fund.account_mut(&params.token);
        if account.available < params.amount {
            return Err(VmError::ExceedFundAvailable);
        }
        account.available = account.available - params.amount;
        save_user_fund(db, &send_block.account_address, &fund);
        Ok(vec![make_send_block(
            block.account_address,
            send_block.account_address,
            BlockType::SendCall,
            params.amount,
            params.token,
            Vec::new(),
        )])
    }
}

struct MethodNewOrder;

impl MethodNewOrder {
    fn render_order(
        db: &mut VmDb, params: &NewOrderParams, address: Address,
    ) -> VmResult<(Order, MarketInfo)> {
        let market =
            get_market_info(db, &params.trade_token, &params.quote_token)?
                .filter(|market| market.valid)
                .ok_or(VmError::MarketNotExists)?;
        if market.stopped {
            return Err(VmError::MarketStopped);
        }
        let vip_reduction = if get_vip(db, &address)?.is_some() {
            VIP_REDUCE_FEE_RATE
        } else {
            0
        };
        let mut order = Order {
            id: next_order_id(db)?,
            market_id: market.market_id,
            address,
            side: params.side,
            order_type: params.order_type,
            price: params.price,
            quantity: params.quantity,
            amount: U256::zero(),
            locked_buy_fee: U256::zero(),
            status: ORDER_STATUS_PENDING,
            executed_quantity: U256::zero(),
            executed_amount: U256::zero(),
            taker_fee_rate: BASE_FEE_RATE - vip_reduction,
            taker_broker_fee_rate: market.taker_broker_fee_rate,
            maker_fee_rate: BASE_FEE_RATE - vip_reduction,
            maker_broker_fee_rate: market.maker_broker_fee_rate,
            timestamp: db.snapshot_timestamp(),
        };
        order.amount = calculate_raw_amount(
            order.quantity,
            order.price,
            market.trade_token_decimals,
            market.quote_token_decimals,
        );
        if order.side == SIDE_BUY {
            order.locked_buy_fee =
                amount_for_rate(order.amount, max_total_fee_rate(&order));
        }
        if order.amount + order.locked_buy_fee < U256::from(MIN_ORDER_AMOUNT)
        {
            return Err(VmError::OrderAmountTooSmall);
        }
        Ok((order, market))
    }

    fn lock_fund(
        db: &mut VmDb, order: &Order, market: &MarketInfo,
    ) -> VmResult<()> {
        let (lock_token, lock_amount) = if order.side == SIDE_SELL {
            (market.trade_token, order.quantity)
        } else {
            (market.quote_token, order.amount + order.locked_buy_fee)
        };
        let mut fund = get_user_fund(db, &order.address)?;
        let account = fund.account_mut(&lock_token);
        if account.available < lock_amount {
            return Err(VmError::ExceedFundAvailable);
        }
        account.available = account.available - lock_amount;
        account.locked = account.locked + lock_amount;
        save_user_fund(db, &order.address, &fund);
        Ok(())
    }
}

impl BuiltinContractMethod for MethodNewOrder {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(NEW_ORDER_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<NewOrderParams>(&block.data)?;
        if !block.amount.is_zero() {
            return Err(VmError::InvalidMethodParam(
                "orders move deposited funds only".into(),
            ));
        }
        if params.quantity.is_zero() {
            return Err(VmError::InvalidOrderQuantity);
        }
        if params.order_type != ORDER_TYPE_LIMIT {
            return Err(VmError::InvalidOrderType);
        }
        if params.price.is_zero()
            || params.price
                >= U256::from(PRICE_FACTOR) * U256::from(PRICE_FACTOR)
        {
            return Err(VmError::InvalidOrderPrice);
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<NewOrderParams>(&send_block.data)?;
        let (order, market) =
            Self::render_order(db, &params, send_block.account_address)?;
        Self::lock_fund(db, &order, &market)?;
        Ok(vec![make_send_block(
            block.account_address,
            *DEX_TRADE_CONTRACT_ADDRESS,
            BlockType::SendCall,
            U256::zero(),
            NATIVE_TOKEN_ID,
            abi::encode_call(
                abi::method_selector(super::trade::SIG_TRADE_NEW_ORDER),
                &order,
            ),
        )])
    }
}

struct MethodSettleOrders;

impl MethodSettleOrders {
    fn apply_fund_settle(
        db: &mut VmDb, action: &UserFundSettle,
    ) -> VmResult<()> {
        let mut fund = get_user_fund(db, &action.address)?;
        for settle in &action.settles {
            let account = fund.account_mut(&settle.token);
            if settle.deduce_locked > account.locked {
                return Err(VmError::ExceedFundLocked);
            }
            account.locked = account.locked - settle.deduce_locked;
            if settle.release_locked > account.locked {
                return Err(VmError::ExceedFundLocked);
            }
            account.locked = account.locked - settle.release_locked;
            account.available =
                account.available + settle.release_locked + settle.inc_available;
        }
        save_user_fund(db, &action.address, &fund);
        Ok(())
    }
}

impl BuiltinContractMethod for MethodSettleOrders {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(SETTLE_ORDERS_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        if block.account_address != *DEX_TRADE_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        let actions = abi::decode_params::<SettleActions>(&block.data)?;
        if actions.fund_actions.is_empty() && actions.fee_actions.is_empty() {
            return Err(VmError::InvalidMethodParam(
                "settle actions empty".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        if send_block.account_address != *DEX_TRADE_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        let actions =
            abi::decode_params::<SettleActions>(&send_block.data)?;
        for action in &actions.fund_actions {
            Self::apply_fund_settle(db, action)?;
        }
        let period = env.current_period(db.snapshot_timestamp());
        for fee_action in &actions.fee_actions {
            let mut base_total = U256::zero();
            for user_fee in &fee_action.user_fees {
                base_total = base_total + user_fee.base_fee;
                add_broker_fee(
                    db,
                    &fee_action.broker,
                    &fee_action.token,
                    user_fee.broker_fee,
                )?;
            }
            add_fee_to_period(db, period, &fee_action.token, base_total)?;
        }
        Ok(Vec::new())
    }
}

struct MethodNewMarket;

impl MethodNewMarket {
    fn complete_market(
        db: &mut VmDb, mut market: MarketInfo, info: &DexTokenInfo,
        period: u64,
    ) -> VmResult<AccountBlock> {
        market.market_id = next_market_id(db)?;
        market.market_symbol = format!(
            "{}_{}",
            dex_token_symbol(info),
            market.market_symbol
        );
        market.trade_token_decimals = info.decimals;
        market.valid = true;
        market.owner = info.owner;
        save_market_info(db, &market);
        db.append_log(lattice_statedb::VmLog {
            topics: vec![keccak_hash::keccak(b"NewMarketEvent")],
            data: rlp::encode(&market).to_vec(),
        });
        // The opening fee becomes dividend pool the moment the market is
        // live.
        add_fee_to_period(
            db,
            period,
            &NATIVE_TOKEN_ID,
            U256::from(NEW_MARKET_FEE),
        )?;
        Ok(make_send_block(
            *super::super::DEX_FUND_CONTRACT_ADDRESS,
            *DEX_TRADE_CONTRACT_ADDRESS,
            BlockType::SendCall,
            U256::zero(),
            NATIVE_TOKEN_ID,
            abi::encode_call(
                abi::method_selector(super::trade::SIG_NOTIFY_NEW_MARKET),
                &market,
            ),
        ))
    }
}

impl BuiltinContractMethod for MethodNewMarket {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(NEW_MARKET_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    /// The opening fee travels as the send amount so the contract balance
    /// backs the later dividend or refund.
    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<NewMarketParams>(&block.data)?;
        if params.trade_token == params.quote_token {
            return Err(VmError::InvalidTokenPair);
        }
        if block.token_id != NATIVE_TOKEN_ID {
            return Err(VmError::InvalidMethodParam(
                "market opening fee must be native".into(),
            ));
        }
        if block.amount < U256::from(NEW_MARKET_FEE) {
            return Err(VmError::InvalidMethodParam(
                "market opening fee too low".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<NewMarketParams>(&send_block.data)?;
        if get_market_info(db, &params.trade_token, &params.quote_token)?
            .is_some()
        {
            return Err(VmError::Contract("market already exists".into()));
        }
        let quote_info = quote_token_info(db, &params.quote_token)?;
        // Anything paid beyond the fixed fee stays with the creator.
        let surplus = send_block
            .amount
            .checked_sub(U256::from(NEW_MARKET_FEE))
            .ok_or(VmError::InsufficientBalance)?;
        if !surplus.is_zero() {
            let mut fund = get_user_fund(db, &send_block.account_address)?;
            let account = fund.account_mut(&NATIVE_TOKEN_ID);
            account.available = account.available + surplus;
            save_user_fund(db, &send_block.account_address, &fund);
        }
        let market = MarketInfo {
            market_id: 0,
            market_symbol: dex_token_symbol(&quote_info),
            trade_token: params.trade_token,
            quote_token: params.quote_token,
            trade_token_decimals: 0,
            quote_token_decimals: quote_info.decimals,
            valid: false,
            stopped: false,
            owner: Address::default(),
            creator: send_block.account_address,
            taker_broker_fee_rate: 0,
            maker_broker_fee_rate: 0,
            timestamp: db.snapshot_timestamp(),
        };

        match get_dex_token_info(db, &params.trade_token)? {
            Some(trade_info) => {
                let period = env.current_period(db.snapshot_timestamp());
                let notify =
                    Self::complete_market(db, market, &trade_info, period)?;
                Ok(vec![notify])
            }
            None => {
                // Trade token unknown: park the market and ask Mintage.
                save_market_info(db, &market);
                add_pending_market(
                    db,
                    &params.trade_token,
                    params.quote_token,
                )?;
                Ok(vec![make_send_block(
                    *super::super::DEX_FUND_CONTRACT_ADDRESS,
                    *MINTAGE_CONTRACT_ADDRESS,
                    BlockType::SendCall,
                    U256::zero(),
                    NATIVE_TOKEN_ID,
                    abi::encode_call(
                        abi::method_selector(mintage::SIG_GET_TOKEN_INFO),
                        &mintage::GetTokenInfoParams {
                            token_id: params.trade_token,
                            bid: TOKEN_BID_NEW_MARKET,
                        },
                    ),
                )])
            }
        }
    }

    fn refund_data(&self, _send_block: &AccountBlock) -> (Vec<u8>, bool) {
        (vec![1], true)
    }
}

struct MethodGetTokenInfoCallback;

impl BuiltinContractMethod for MethodGetTokenInfoCallback {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(CALLBACK_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<TokenInfoCallbackParams>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        if send_block.account_address != *MINTAGE_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        let params =
            abi::decode_params::<TokenInfoCallbackParams>(&send_block.data)?;
        if params.bid != TOKEN_BID_NEW_MARKET {
            return Err(VmError::InvalidMethodParam(
                "unknown token info bid".into(),
            ));
        }
        let quotes = take_pending_markets(db, &params.token_id)?;
        let mut sends = Vec::new();
        if params.exist {
            let info = DexTokenInfo {
                symbol: params.symbol.clone(),
                decimals: params.decimals,
                index: params.index,
                owner: params.owner,
            };
            save_dex_token_info(db, &params.token_id, &info);
            let period = env.current_period(db.snapshot_timestamp());
            for quote in quotes {
                let market =
                    match get_market_info(db, &params.token_id, &quote)? {
                        Some(market) if !market.valid => market,
                        _ => continue,
                    };
                sends.push(MethodNewMarket::complete_market(
                    db, market, &info, period,
                )?);
            }
        } else {
            for quote in quotes {
                let market =
                    match get_market_info(db, &params.token_id, &quote)? {
                        Some(market) if !market.valid => market,
                        _ => continue,
                    };
                delete_market_info(db, &params.token_id, &quote);
                // The opening fee goes back to whoever tried to open the
                // market.
                sends.push(make_send_block(
                    *super::super::DEX_FUND_CONTRACT_ADDRESS,
                    market.creator,
                    BlockType::SendCall,
                    U256::from(NEW_MARKET_FEE),
                    NATIVE_TOKEN_ID,
                    Vec::new(),
                ));
            }
        }
        Ok(sends)
    }
}

struct MethodPledgeForVx;

impl BuiltinContractMethod for MethodPledgeForVx {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(PLEDGE_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<PledgeForVxParams>(&block.data)?;
        if params.action_type != PLEDGE_ACTION_PLEDGE
            && params.action_type != PLEDGE_ACTION_CANCEL
        {
            return Err(VmError::InvalidMethodParam(
                "unknown pledge action".into(),
            ));
        }
        if params.amount < U256::from(PLEDGE_FOR_VX_MIN_AMOUNT) {
            return Err(VmError::InvalidMethodParam(
                "pledge amount below minimum".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<PledgeForVxParams>(&send_block.data)?;
        let user = send_block.account_address;
        if params.action_type == PLEDGE_ACTION_PLEDGE {
            let mut fund = get_user_fund(db, &user)?;
            let account = fund.account_mut(&NATIVE_TOKEN_ID);
            if account.available < params.amount {
                return Err(VmError::ExceedFundAvailable);
            }
            account.available = account.available - params.amount;
            save_user_fund(db, &user, &fund);
            Ok(vec![make_send_block(
                block.account_address,
                *PLEDGE_CONTRACT_ADDRESS,
                BlockType::SendCall,
                params.amount,
                NATIVE_TOKEN_ID,
                agent_pledge_data(&user, PLEDGE_BID_VX),
            )])
        } else {
            let pledged = get_vx_pledge(db, &user)?;
            let remaining = pledged
                .checked_sub(params.amount)
                .ok_or(VmError::ExceedPledgeAvailable)?;
            if !remaining.is_zero()
                && remaining < U256::from(PLEDGE_FOR_VX_MIN_AMOUNT)
            {
                return Err(VmError::ExceedPledgeAvailable);
            }
            Ok(vec![make_send_block(
                block.account_address,
                *PLEDGE_CONTRACT_ADDRESS,
                BlockType::SendCall,
                U256::zero(),
                NATIVE_TOKEN_ID,
                agent_cancel_pledge_data(&user, params.amount, PLEDGE_BID_VX),
            )])
        }
    }
}

struct MethodPledgeForVip;

impl BuiltinContractMethod for MethodPledgeForVip {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(PLEDGE_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        let params = abi::decode_params::<PledgeForVipParams>(&block.data)?;
        if params.action_type != PLEDGE_ACTION_PLEDGE
            && params.action_type != PLEDGE_ACTION_CANCEL
        {
            return Err(VmError::InvalidMethodParam(
                "unknown pledge action".into(),
            ));
        }
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<PledgeForVipParams>(&send_block.data)?;
        let user = send_block.account_address;
        let amount = U256::from(PLEDGE_FOR_VIP_AMOUNT);
        if params.action_type == PLEDGE_ACTION_PLEDGE {
            if get_vip(db, &user)?.is_some() {
                return Err(VmError::PledgeForVipExists);
            }
            let mut fund = get_user_fund(db, &user)?;
            let account = fund.account_mut(&NATIVE_TOKEN_ID);
            if account.available < amount {
                return Err(VmError::ExceedFundAvailable);
            }
            account.available = account.available - amount;
            save_user_fund(db, &user, &fund);
            Ok(vec![make_send_block(
                block.account_address,
                *PLEDGE_CONTRACT_ADDRESS,
                BlockType::SendCall,
                amount,
                NATIVE_TOKEN_ID,
                agent_pledge_data(&user, PLEDGE_BID_VIP),
            )])
        } else {
            let vip = get_vip(db, &user)?
                .ok_or(VmError::PledgeForVipNotExists)?;
            if vip.pledge_times == 1
                && db.snapshot_timestamp().saturating_sub(vip.timestamp)
                    < PLEDGE_FOR_VIP_DURATION
            {
                return Err(VmError::PledgeForVipNotExpire);
            }
            Ok(vec![make_send_block(
                block.account_address,
                *PLEDGE_CONTRACT_ADDRESS,
                BlockType::SendCall,
                U256::zero(),
                NATIVE_TOKEN_ID,
                agent_cancel_pledge_data(&user, amount, PLEDGE_BID_VIP),
            )])
        }
    }
}

struct MethodPledgeCallback;

impl BuiltinContractMethod for MethodPledgeCallback {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(CALLBACK_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<PledgeCallbackParams>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        if send_block.account_address != *PLEDGE_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        let params =
            abi::decode_params::<PledgeCallbackParams>(&send_block.data)?;
        if params.success {
            match params.bid {
                PLEDGE_BID_VX => {
                    let pledged = get_vx_pledge(db, &params.pledge_addr)?;
                    set_vx_pledge(
                        db,
                        &params.pledge_addr,
                        pledged + params.amount,
                    );
                }
                PLEDGE_BID_VIP => {
                    let vip = get_vip(db, &params.pledge_addr)?
                        .unwrap_or_default();
                    db.set_storage(
                        vip_key(&params.pledge_addr),
                        rlp::encode(&PledgeVip {
                            timestamp: db.snapshot_timestamp(),
                            pledge_times: vip.pledge_times + 1,
                        })
                        .to_vec(),
                    );
                }
                _ => {
                    return Err(VmError::InvalidMethodParam(
                        "unknown pledge bid".into(),
                    ))
                }
            }
        } else {
            // Stake bounced; the amount came back with this send.
            let mut fund = get_user_fund(db, &params.pledge_addr)?;
            let account = fund.account_mut(&NATIVE_TOKEN_ID);
            account.available = account.available + params.amount;
            save_user_fund(db, &params.pledge_addr, &fund);
        }
        Ok(Vec::new())
    }
}

struct MethodCancelPledgeCallback;

impl BuiltinContractMethod for MethodCancelPledgeCallback {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(CALLBACK_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<PledgeCallbackParams>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        if send_block.account_address != *PLEDGE_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        let params =
            abi::decode_params::<PledgeCallbackParams>(&send_block.data)?;
        if !params.success {
            return Ok(Vec::new());
        }
        match params.bid {
            PLEDGE_BID_VX => {
                let pledged = get_vx_pledge(db, &params.pledge_addr)?;
                let remaining = pledged
                    .checked_sub(params.amount)
                    .ok_or(VmError::ExceedPledgeAvailable)?;
                set_vx_pledge(db, &params.pledge_addr, remaining);
            }
            PLEDGE_BID_VIP => {
                db.delete_storage(vip_key(&params.pledge_addr));
            }
            _ => {
                return Err(VmError::InvalidMethodParam(
                    "unknown pledge bid".into(),
                ))
            }
        }
        // The unlocked stake arrived with this callback send.
        let mut fund = get_user_fund(db, &params.pledge_addr)?;
        let account = fund.account_mut(&NATIVE_TOKEN_ID);
        account.available = account.available + send_block.amount;
        save_user_fund(db, &params.pledge_addr, &fund);
        Ok(Vec::new())
    }
}

/// Distributes a period's collected fees (or mined VX) across VX stakers
/// pro rata, crediting the dust to the exchange owner.
fn distribute_to_stakers(
    db: &mut VmDb, token: &TokenId, pool: U256, owner: &Address,
) -> VmResult<()> {
    if pool.is_zero() {
        return Ok(());
    }
    let stakers: Vec<(Address, U256)> = db
        .new_storage_iterator(VX_PLEDGE_KEY_PREFIX)?
        .into_iter()
        .filter_map(|(key, value)| {
            let addr = Address::from_slice(
                &key[VX_PLEDGE_KEY_PREFIX.len()..],
            )
            .ok()?;
            let staked: U256 = rlp::decode(&value).ok()?;
            Some((addr, staked))
        })
        .collect();
    let total: U256 = stakers
        .iter()
        .fold(U256::zero(), |sum, (_, staked)| sum + *staked);

    let mut distributed = U256::zero();
    if !total.is_zero() {
        for (addr, staked) in &stakers {
            let share = pool * *staked / total;
            if share.is_zero() {
                continue;
            }
            let mut fund = get_user_fund(db, addr)?;
            let account = fund.account_mut(token);
            account.available = account.available + share;
            save_user_fund(db, addr, &fund);
            distributed = distributed + share;
        }
    }
    let dust = pool - distributed;
    if !dust.is_zero() {
        let mut fund = get_user_fund(db, owner)?;
        let account = fund.account_mut(token);
        account.available = account.available + dust;
        save_user_fund(db, owner, &fund);
    }
    Ok(())
}

fn check_period_gate(
    db: &VmDb, env: &VmEnv, last_key: &[u8], period_id: u64,
) -> VmResult<()> {
    let last = last_settled_period(db, last_key)?;
    if period_id != last + 1 {
        return Err(VmError::Contract("period id not consecutive".into()));
    }
    if period_id >= env.current_period(db.snapshot_timestamp()) {
        return Err(VmError::Contract("period not finished".into()));
    }
    Ok(())
}

struct MethodFeeDividend;

impl BuiltinContractMethod for MethodFeeDividend {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(DIVIDEND_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<PeriodParams>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        check_owner(db, &send_block.account_address)?;
        let params = abi::decode_params::<PeriodParams>(&send_block.data)?;
        check_period_gate(db, env, KEY_LAST_FEE_PERIOD, params.period_id)?;

        let mut fee_sum = get_fee_sum(db, params.period_id)?;
        if fee_sum.finish_fee_dividend {
            return Err(VmError::Contract("period already dividended".into()));
        }
        let owner = send_block.account_address;
        for fee in fee_sum.fees.clone() {
            distribute_to_stakers(db, &fee.token, fee.dividend_pool, &owner)?;
        }
        fee_sum.finish_fee_dividend = true;
        save_fee_sum(db, params.period_id, &fee_sum);
        db.set_storage(
            KEY_LAST_FEE_PERIOD.to_vec(),
            rlp::encode(&params.period_id).to_vec(),
        );
        Ok(Vec::new())
    }
}

struct MethodMinedVxDividend;

impl BuiltinContractMethod for MethodMinedVxDividend {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(DIVIDEND_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<PeriodParams>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        check_owner(db, &send_block.account_address)?;
        let params = abi::decode_params::<PeriodParams>(&send_block.data)?;
        check_period_gate(db, env, KEY_LAST_VX_PERIOD, params.period_id)?;

        // Mined VX is drawn from the contract's pre-funded VX balance;
        // custody stays conserved.
        let minted = U256::from(VX_MINED_PER_PERIOD);
        let custodied = db
            .new_storage_iterator(FUND_KEY_PREFIX)?
            .into_iter()
            .filter_map(|(_, raw)| rlp::decode::<UserFund>(&raw).ok())
            .filter_map(|fund| {
                fund.account(&VX_TOKEN_ID)
                    .map(|account| account.available + account.locked)
            })
            .fold(U256::zero(), |sum, amount| sum + amount);
        if db.get_balance(&VX_TOKEN_ID)? < custodied + minted {
            return Err(VmError::Contract("vx pool exhausted".into()));
        }
        let owner = send_block.account_address;
        distribute_to_stakers(db, &VX_TOKEN_ID, minted, &owner)?;
        db.set_storage(
            KEY_LAST_VX_PERIOD.to_vec(),
            rlp::encode(&params.period_id).to_vec(),
        );
        Ok(Vec::new())
    }
}

struct MethodOwnerConfig;

impl BuiltinContractMethod for MethodOwnerConfig {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> { Ok(CALLBACK_GAS) }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<OwnerConfigParams>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<OwnerConfigParams>(&send_block.data)?;
        // First call claims ownership; afterwards only the owner rotates it.
        if get_owner(db)?.is_some() {
            check_owner(db, &send_block.account_address)?;
        }
        set_owner(db, &params.owner);
        Ok(Vec::new())
    }
}

fn agent_pledge_data(user: &Address, bid: u8) -> Vec<u8> {
    abi::encode_call(
        abi::method_selector(crate::builtin::pledge::SIG_AGENT_PLEDGE),
        &crate::builtin::pledge::AgentPledgeParams {
            pledge_addr: *user,
            beneficiary: *super::super::DEX_FUND_CONTRACT_ADDRESS,
            bid,
        },
    )
}

fn agent_cancel_pledge_data(user: &Address, amount: U256, bid: u8) -> Vec<u8> {
    abi::encode_call(
        abi::method_selector(
            crate::builtin::pledge::SIG_AGENT_CANCEL_PLEDGE,
        ),
        &crate::builtin::pledge::AgentCancelPledgeParams {
            pledge_addr: *user,
            beneficiary: *super::super::DEX_FUND_CONTRACT_ADDRESS,
            amount,
            bid,
        },
    )
}

pub fn method_table() -> HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> {
    let mut table: HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> =
        HashMap::new();
    table.insert(abi::method_selector(SIG_DEPOSIT), Arc::new(MethodDeposit));
    table
        .insert(abi::method_selector(SIG_WITHDRAW), Arc::new(MethodWithdraw));
    table
        .insert(abi::method_selector(SIG_NEW_ORDER), Arc::new(MethodNewOrder));
    table.insert(
        abi::method_selector(SIG_SETTLE_ORDERS),
        Arc::new(MethodSettleOrders),
    );
    table.insert(
        abi::method_selector(SIG_NEW_MARKET),
        Arc::new(MethodNewMarket),
    );
    table.insert(
        abi::method_selector(SIG_FEE_DIVIDEND),
        Arc::new(MethodFeeDividend),
    );
    table.insert(
        abi::method_selector(SIG_MINED_VX_DIVIDEND),
        Arc::new(MethodMinedVxDividend),
    );
    table.insert(
        abi::method_selector(SIG_PLEDGE_FOR_VX),
        Arc::new(MethodPledgeForVx),
    );
    table.insert(
        abi::method_selector(SIG_PLEDGE_FOR_VIP),
        Arc::new(MethodPledgeForVip),
    );
    table.insert(
        abi::method_selector(SIG_PLEDGE_CALLBACK),
        Arc::new(MethodPledgeCallback),
    );
    table.insert(
        abi::method_selector(SIG_CANCEL_PLEDGE_CALLBACK),
        Arc::new(MethodCancelPledgeCallback),
    );
    table.insert(
        abi::method_selector(SIG_GET_TOKEN_INFO_CALLBACK),
        Arc::new(MethodGetTokenInfoCallback),
    );
    table.insert(
        abi::method_selector(SIG_OWNER_CONFIG),
        Arc::new(MethodOwnerConfig),
    );
    table
}

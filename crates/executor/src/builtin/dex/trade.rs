// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! DexTrade: the order book side of the exchange. Accepts rendered orders
//! and market advertisements from DexFund, and reports fund movements back
//! through `SettleOrders` sends. Matching itself runs off-chain.

use super::state::*;
use crate::{
    abi,
    builtin::{
        BuiltinContractMethod, DEX_FUND_CONTRACT_ADDRESS,
    },
    env::VmEnv,
    error::{VmError, VmResult},
    vm::make_send_block,
};
use lattice_statedb::VmDb;
use lattice_types::{U256, NATIVE_TOKEN_ID};
use primitives::{AccountBlock, BlockType};
use rlp_derive::{RlpDecodable, RlpEncodable};
use std::{collections::HashMap, sync::Arc};

pub const SIG_TRADE_NEW_ORDER: &str = "TradeNewOrder(bytes)";
pub const SIG_TRADE_CANCEL_ORDER: &str = "TradeCancelOrder(uint32,uint64)";
pub const SIG_NOTIFY_NEW_MARKET: &str = "TradeNotifyNewMarket(bytes)";

const TRADE_NEW_ORDER_GAS: u64 = 10_500;
const TRADE_CANCEL_ORDER_GAS: u64 = 10_500;
const NOTIFY_NEW_MARKET_GAS: u64 = 10_500;

#[derive(RlpEncodable, RlpDecodable)]
pub struct CancelOrderParams {
    pub market_id: u32,
    pub order_id: u64,
}

fn read_order(
    db: &VmDb, market_id: u32, order_id: u64,
) -> VmResult<Option<Order>> {
    match db.get_storage(&order_key(market_id, order_id))? {
        None => Ok(None),
        Some(raw) => rlp::decode(&raw)
            .map(Some)
            .map_err(|e| VmError::State(e.to_string())),
    }
}

fn write_order(db: &mut VmDb, order: &Order) {
    db.set_storage(
        order_key(order.market_id, order.id),
        rlp::encode(order).to_vec(),
    );
}

struct MethodTradeNewOrder;

impl BuiltinContractMethod for MethodTradeNewOrder {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(TRADE_NEW_ORDER_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        if block.account_address != *DEX_FUND_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        abi::decode_params::<Order>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        if send_block.account_address != *DEX_FUND_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        let order = abi::decode_params::<Order>(&send_block.data)?;
        if read_order(db, order.market_id, order.id)?.is_some() {
            return Err(VmError::Contract("order id already booked".into()));
        }
        write_order(db, &order);
        Ok(Vec::new())
    }
}

struct MethodTradeCancelOrder;

impl BuiltinContractMethod for MethodTradeCancelOrder {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(TRADE_CANCEL_ORDER_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        abi::decode_params::<CancelOrderParams>(&block.data)?;
        Ok(())
    }

    /// Marks the order cancelled and reports the remaining locked funds
    /// back to DexFund for release.
    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        let params =
            abi::decode_params::<CancelOrderParams>(&send_block.data)?;
        let mut order =
            read_order(db, params.market_id, params.order_id)?
                .ok_or_else(|| {
                    VmError::Contract("order not found".into())
                })?;
        if order.address != send_block.account_address {
            return Err(VmError::InvalidSourceAddress);
        }
        if order.status != ORDER_STATUS_PENDING
            && order.status != ORDER_STATUS_PARTIAL
        {
            return Err(VmError::Contract("order not cancellable".into()));
        }
        let market = read_trade_market(db, order.market_id)?
            .ok_or(VmError::MarketNotExists)?;

        let (token, release) = if order.side == SIDE_SELL {
            (market.trade_token, order.quantity - order.executed_quantity)
        } else {
            (
                market.quote_token,
                (order.amount + order.locked_buy_fee)
                    .saturating_sub(order.executed_amount),
            )
        };
        order.status = ORDER_STATUS_CANCELLED;
        write_order(db, &order);

        let actions = SettleActions {
            fund_actions: vec![UserFundSettle {
                address: order.address,
                settles: vec![FundSettle {
                    token,
                    deduce_locked: U256::zero(),
                    release_locked: release,
                    inc_available: U256::zero(),
                }],
            }],
            fee_actions: Vec::new(),
        };
        Ok(vec![make_send_block(
            block.account_address,
            *DEX_FUND_CONTRACT_ADDRESS,
            BlockType::SendCall,
            U256::zero(),
            NATIVE_TOKEN_ID,
            abi::encode_call(
                abi::method_selector(super::fund::SIG_SETTLE_ORDERS),
                &actions,
            ),
        )])
    }
}

struct MethodNotifyNewMarket;

impl BuiltinContractMethod for MethodNotifyNewMarket {
    fn send_quota(&self, _data: &[u8]) -> VmResult<u64> {
        Ok(NOTIFY_NEW_MARKET_GAS)
    }

    fn receive_quota(&self) -> u64 { 0 }

    fn do_send(&self, _db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>
    {
        if block.account_address != *DEX_FUND_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        abi::decode_params::<MarketInfo>(&block.data)?;
        Ok(())
    }

    fn do_receive(
        &self, db: &mut VmDb, _block: &AccountBlock,
        send_block: &AccountBlock, _env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>> {
        if send_block.account_address != *DEX_FUND_CONTRACT_ADDRESS {
            return Err(VmError::InvalidSourceAddress);
        }
        let market = abi::decode_params::<MarketInfo>(&send_block.data)?;
        db.set_storage(
            trade_market_key(&market.trade_token, &market.quote_token),
            rlp::encode(&market).to_vec(),
        );
        // Indexed by id as well so cancels can find the pair.
        db.set_storage(
            trade_market_id_key(market.market_id),
            rlp::encode(&market).to_vec(),
        );
        Ok(Vec::new())
    }
}

pub fn trade_market_id_key(market_id: u32) -> Vec<u8> {
    let mut key = b"ti:".to_vec();
    key.extend_from_slice(&market_id.to_be_bytes());
    key
}

fn read_trade_market(
    db: &VmDb, market_id: u32,
) -> VmResult<Option<MarketInfo>> {
    match db.get_storage(&trade_market_id_key(market_id))? {
        None => Ok(None),
        Some(raw) => rlp::decode(&raw)
            .map(Some)
            .map_err(|e| VmError::State(e.to_string())),
    }
}

pub fn method_table() -> HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> {
    let mut table: HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>> =
        HashMap::new();
    table.insert(
        abi::method_selector(SIG_TRADE_NEW_ORDER),
        Arc::new(MethodTradeNewOrder),
    );
    table.insert(
        abi::method_selector(SIG_TRADE_CANCEL_ORDER),
        Arc::new(MethodTradeCancelOrder),
    );
    table.insert(
        abi::method_selector(SIG_NOTIFY_NEW_MARKET),
        Arc::new(MethodNotifyNewMarket),
    );
    table
}

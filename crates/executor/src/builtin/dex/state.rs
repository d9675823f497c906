// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! DexFund and DexTrade state records and storage helpers. All records are
//! RLP in contract storage; amounts are `U256`.

use crate::error::{VmError, VmResult};
use lattice_statedb::VmDb;
use lattice_types::{Address, TokenId, U256};
use rlp_derive::{RlpDecodable, RlpEncodable};

pub const SIDE_BUY: bool = false;
pub const SIDE_SELL: bool = true;

pub const ORDER_TYPE_LIMIT: u8 = 0;
pub const ORDER_TYPE_MARKET: u8 = 1;

pub const ORDER_STATUS_PENDING: u8 = 0;
pub const ORDER_STATUS_PARTIAL: u8 = 1;
pub const ORDER_STATUS_FILLED: u8 = 2;
pub const ORDER_STATUS_CANCELLED: u8 = 3;

/// Prices carry twelve implied decimals.
pub const PRICE_FACTOR: u64 = 1_000_000_000_000;
/// Fee rates are parts per hundred thousand.
pub const RATE_FACTOR: u64 = 100_000;

pub const BASE_FEE_RATE: u32 = 200;
pub const VIP_REDUCE_FEE_RATE: u32 = 100;
pub const MAX_BROKER_FEE_RATE: u32 = 200;

pub const NEW_MARKET_FEE: u64 = 10_000_000;
pub const PLEDGE_FOR_VIP_AMOUNT: u64 = 10_000_000;
pub const PLEDGE_FOR_VX_MIN_AMOUNT: u64 = 134;
pub const PLEDGE_FOR_VIP_DURATION: u64 = 2_592_000;
pub const MIN_ORDER_AMOUNT: u64 = 1_000;

/// The exchange's mining token, issued through the dividend flow.
pub const VX_TOKEN_ID: TokenId =
    TokenId([0x56, 0x58, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02]);
pub const VX_MINED_PER_PERIOD: u64 = 10_000;

pub const PLEDGE_BID_VX: u8 = 1;
pub const PLEDGE_BID_VIP: u8 = 2;
pub const TOKEN_BID_NEW_MARKET: u8 = 1;

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, Default, PartialEq, Eq)]
pub struct FundAccount {
    pub token: TokenId,
    pub available: U256,
    pub locked: U256,
}

/// Per-user exchange balances; at most one entry per token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserFund {
    pub accounts: Vec<FundAccount>,
}

impl rlp::Encodable for UserFund {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(1).append_list(&self.accounts);
    }
}

impl rlp::Decodable for UserFund {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(UserFund { accounts: rlp.list_at(0)? })
    }
}

impl UserFund {
    pub fn account(&self, token: &TokenId) -> Option<&FundAccount> {
        self.accounts.iter().find(|account| account.token == *token)
    }

    pub fn account_mut(&mut self, token: &TokenId) -> &mut FundAccount {
        if let Some(index) =
            self.accounts.iter().position(|account| account.token == *token)
        {
            return &mut self.accounts[index];
        }
        self.accounts.push(FundAccount {
            token: *token,
            ..Default::default()
        });
        self.accounts.last_mut().unwrap()
    }
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct MarketInfo {
    pub market_id: u32,
    pub market_symbol: String,
    pub trade_token: TokenId,
    pub quote_token: TokenId,
    pub trade_token_decimals: u8,
    pub quote_token_decimals: u8,
    pub valid: bool,
    pub stopped: bool,
    pub owner: Address,
    pub creator: Address,
    pub taker_broker_fee_rate: u32,
    pub maker_broker_fee_rate: u32,
    pub timestamp: u64,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, Default, PartialEq, Eq)]
pub struct DexTokenInfo {
    pub symbol: String,
    pub decimals: u8,
    pub index: u16,
    pub owner: Address,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub id: u64,
    pub market_id: u32,
    pub address: Address,
    pub side: bool,
    pub order_type: u8,
    pub price: U256,
    pub quantity: U256,
    pub amount: U256,
    pub locked_buy_fee: U256,
    pub status: u8,
    pub executed_quantity: U256,
    pub executed_amount: U256,
    pub taker_fee_rate: u32,
    pub taker_broker_fee_rate: u32,
    pub maker_fee_rate: u32,
    pub maker_broker_fee_rate: u32,
    pub timestamp: u64,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, Default, PartialEq, Eq)]
pub struct PledgeVip {
    pub timestamp: u64,
    pub pledge_times: u32,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, Default, PartialEq, Eq)]
pub struct FeeAmount {
    pub token: TokenId,
    pub dividend_pool: U256,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeeSumByPeriod {
    pub fees: Vec<FeeAmount>,
    pub finish_fee_dividend: bool,
    pub finish_vx_dividend: bool,
}

impl rlp::Encodable for FeeSumByPeriod {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(3);
        s.append_list(&self.fees);
        s.append(&self.finish_fee_dividend)
            .append(&self.finish_vx_dividend);
    }
}

impl rlp::Decodable for FeeSumByPeriod {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(FeeSumByPeriod {
            fees: rlp.list_at(0)?,
            finish_fee_dividend: rlp.val_at(1)?,
            finish_vx_dividend: rlp.val_at(2)?,
        })
    }
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerFeeAccount {
    pub token: TokenId,
    pub amount: U256,
}

// Settlement messages from DexTrade.

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, Default, PartialEq, Eq)]
pub struct FundSettle {
    pub token: TokenId,
    pub deduce_locked: U256,
    pub release_locked: U256,
    pub inc_available: U256,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserFundSettle {
    pub address: Address,
    pub settles: Vec<FundSettle>,
}

impl rlp::Encodable for UserFundSettle {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(2).append(&self.address).append_list(&self.settles);
    }
}

impl rlp::Decodable for UserFundSettle {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(UserFundSettle {
            address: rlp.val_at(0)?,
            settles: rlp.list_at(1)?,
        })
    }
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserFeeSettle {
    pub address: Address,
    pub base_fee: U256,
    pub broker_fee: U256,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeeSettle {
    pub token: TokenId,
    pub broker: Address,
    pub user_fees: Vec<UserFeeSettle>,
}

impl rlp::Encodable for FeeSettle {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(3)
            .append(&self.token)
            .append(&self.broker)
            .append_list(&self.user_fees);
    }
}

impl rlp::Decodable for FeeSettle {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(FeeSettle {
            token: rlp.val_at(0)?,
            broker: rlp.val_at(1)?,
            user_fees: rlp.list_at(2)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettleActions {
    pub fund_actions: Vec<UserFundSettle>,
    pub fee_actions: Vec<FeeSettle>,
}

impl rlp::Encodable for SettleActions {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(2);
        s.append_list(&self.fund_actions);
        s.append_list(&self.fee_actions);
    }
}

impl rlp::Decodable for SettleActions {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(SettleActions {
            fund_actions: rlp.list_at(0)?,
            fee_actions: rlp.list_at(1)?,
        })
    }
}

// Storage keys. Funds, markets, fees and pledges live under the DexFund
// address; orders and market mirrors under DexTrade.

pub fn fund_key(addr: &Address) -> Vec<u8> {
    let mut key = b"fd:".to_vec();
    key.extend_from_slice(addr.as_bytes());
    key
}

pub const FUND_KEY_PREFIX: &[u8] = b"fd:";

pub fn market_key(trade: &TokenId, quote: &TokenId) -> Vec<u8> {
    let mut key = b"mk:".to_vec();
    key.extend_from_slice(trade.as_bytes());
    key.extend_from_slice(quote.as_bytes());
    key
}

pub fn token_info_key(token: &TokenId) -> Vec<u8> {
    let mut key = b"tk:".to_vec();
    key.extend_from_slice(token.as_bytes());
    key
}

pub fn pending_market_key(trade: &TokenId) -> Vec<u8> {
    let mut key = b"pm:".to_vec();
    key.extend_from_slice(trade.as_bytes());
    key
}

pub fn fee_sum_key(period: u64) -> Vec<u8> {
    let mut key = b"fs:".to_vec();
    key.extend_from_slice(&period.to_be_bytes());
    key
}

pub const FEE_SUM_KEY_PREFIX: &[u8] = b"fs:";

pub fn broker_fee_key(broker: &Address) -> Vec<u8> {
    let mut key = b"bf:".to_vec();
    key.extend_from_slice(broker.as_bytes());
    key
}

pub const BROKER_FEE_KEY_PREFIX: &[u8] = b"bf:";

pub fn vx_pledge_key(addr: &Address) -> Vec<u8> {
    let mut key = b"px:".to_vec();
    key.extend_from_slice(addr.as_bytes());
    key
}

pub const VX_PLEDGE_KEY_PREFIX: &[u8] = b"px:";

pub fn vip_key(addr: &Address) -> Vec<u8> {
    let mut key = b"pv:".to_vec();
    key.extend_from_slice(addr.as_bytes());
    key
}

pub const KEY_MARKET_ID: &[u8] = b"mi";
pub const KEY_ORDER_ID: &[u8] = b"oi";
pub const KEY_OWNER: &[u8] = b"ow";
pub const KEY_LAST_FEE_PERIOD: &[u8] = b"lf";
pub const KEY_LAST_VX_PERIOD: &[u8] = b"lv";

pub fn order_key(market_id: u32, order_id: u64) -> Vec<u8> {
    let mut key = b"od:".to_vec();
    key.extend_from_slice(&market_id.to_be_bytes());
    key.extend_from_slice(&order_id.to_be_bytes());
    key
}

pub fn trade_market_key(trade: &TokenId, quote: &TokenId) -> Vec<u8> {
    let mut key = b"tm:".to_vec();
    key.extend_from_slice(trade.as_bytes());
    key.extend_from_slice(quote.as_bytes());
    key
}

fn decode<T: rlp::Decodable>(raw: &[u8]) -> VmResult<T> {
    rlp::decode(raw).map_err(|e| VmError::State(e.to_string()))
}

pub fn get_user_fund(db: &VmDb, addr: &Address) -> VmResult<UserFund> {
    match db.get_storage(&fund_key(addr))? {
        None => Ok(UserFund::default()),
        Some(raw) => decode(&raw),
    }
}

pub fn save_user_fund(db: &mut VmDb, addr: &Address, fund: &UserFund) {
    db.set_storage(fund_key(addr), rlp::encode(fund).to_vec());
}

pub fn get_market_info(
    db: &VmDb, trade: &TokenId, quote: &TokenId,
) -> VmResult<Option<MarketInfo>> {
    match db.get_storage(&market_key(trade, quote))? {
        None => Ok(None),
        Some(raw) => decode(&raw).map(Some),
    }
}

pub fn save_market_info(db: &mut VmDb, market: &MarketInfo) {
    db.set_storage(
        market_key(&market.trade_token, &market.quote_token),
        rlp::encode(market).to_vec(),
    );
}

pub fn delete_market_info(db: &mut VmDb, trade: &TokenId, quote: &TokenId) {
    db.delete_storage(market_key(trade, quote));
}

pub fn get_dex_token_info(
    db: &VmDb, token: &TokenId,
) -> VmResult<Option<DexTokenInfo>> {
    match db.get_storage(&token_info_key(token))? {
        None => Ok(None),
        Some(raw) => decode(&raw).map(Some),
    }
}

pub fn save_dex_token_info(
    db: &mut VmDb, token: &TokenId, info: &DexTokenInfo,
) {
    db.set_storage(token_info_key(token), rlp::encode(info).to_vec());
}

pub fn add_pending_market(
    db: &mut VmDb, trade: &TokenId, quote: TokenId,
) -> VmResult<()> {
    let mut quotes: Vec<TokenId> =
        match db.get_storage(&pending_market_key(trade))? {
            None => Vec::new(),
            Some(raw) => rlp::Rlp::new(&raw)
                .as_list()
                .map_err(|e| VmError::State(e.to_string()))?,
        };
    if !quotes.contains(&quote) {
        quotes.push(quote);
    }
    let mut s = rlp::RlpStream::new();
    s.append_list(&quotes);
    db.set_storage(pending_market_key(trade), s.out().to_vec());
    Ok(())
}

/// Removes and returns the quote tokens waiting on `trade`'s token info.
pub fn take_pending_markets(
    db: &mut VmDb, trade: &TokenId,
) -> VmResult<Vec<TokenId>> {
    let quotes: Vec<TokenId> =
        match db.get_storage(&pending_market_key(trade))? {
            None => Vec::new(),
            Some(raw) => rlp::Rlp::new(&raw)
                .as_list()
                .map_err(|e| VmError::State(e.to_string()))?,
        };
    db.delete_storage(pending_market_key(trade));
    Ok(quotes)
}

pub fn next_market_id(db: &mut VmDb) -> VmResult<u32> {
    let id = match db.get_storage(KEY_MARKET_ID)? {
        None => 1u32,
        Some(raw) => decode::<u32>(&raw)? + 1,
    };
    db.set_storage(KEY_MARKET_ID.to_vec(), rlp::encode(&id).to_vec());
    Ok(id)
}

pub fn next_order_id(db: &mut VmDb) -> VmResult<u64> {
    let id = match db.get_storage(KEY_ORDER_ID)? {
        None => 1u64,
        Some(raw) => decode::<u64>(&raw)? + 1,
    };
    db.set_storage(KEY_ORDER_ID.to_vec(), rlp::encode(&id).to_vec());
    Ok(id)
}

pub fn get_owner(db: &VmDb) -> VmResult<Option<Address>> {
    match db.get_storage(KEY_OWNER)? {
        None => Ok(None),
        Some(raw) => decode(&raw).map(Some),
    }
}

pub fn set_owner(db: &mut VmDb, owner: &Address) {
    db.set_storage(KEY_OWNER.to_vec(), rlp::encode(owner).to_vec());
}

pub fn get_fee_sum(db: &VmDb, period: u64) -> VmResult<FeeSumByPeriod> {
    match db.get_storage(&fee_sum_key(period))? {
        None => Ok(FeeSumByPeriod::default()),
        Some(raw) => decode(&raw),
    }
}

pub fn save_fee_sum(db: &mut VmDb, period: u64, fee_sum: &FeeSumByPeriod) {
    db.set_storage(fee_sum_key(period), rlp::encode(fee_sum).to_vec());
}

pub fn add_fee_to_period(
    db: &mut VmDb, period: u64, token: &TokenId, amount: U256,
) -> VmResult<()> {
    if amount.is_zero() {
        return Ok(());
    }
    let mut fee_sum = get_fee_sum(db, period)?;
    match fee_sum.fees.iter_mut().find(|fee| fee.token == *token) {
        Some(fee) => fee.dividend_pool = fee.dividend_pool + amount,
        None => fee_sum.fees.push(FeeAmount {
            token: *token,
            dividend_pool: amount,
        }),
    }
    save_fee_sum(db, period, &fee_sum);
    Ok(())
}

pub fn add_broker_fee(
    db: &mut VmDb, broker: &Address, token: &TokenId, amount: U256,
) -> VmResult<()> {
    if amount.is_zero() {
        return Ok(());
    }
    let key = broker_fee_key(broker);
    let mut accounts: Vec<BrokerFeeAccount> = match db.get_storage(&key)? {
        None => Vec::new(),
        Some(raw) => rlp::Rlp::new(&raw)
            .as_list()
            .map_err(|e| VmError::State(e.to_string()))?,
    };
    match accounts.iter_mut().find(|account| account.token == *token) {
        Some(account) => account.amount = account.amount + amount,
        None => accounts.push(BrokerFeeAccount { token: *token, amount }),
    }
    let mut s = rlp::RlpStream::new();
    s.append_list(&accounts);
    db.set_storage(key, s.out().to_vec());
    Ok(())
}

pub fn get_vx_pledge(db: &VmDb, addr: &Address) -> VmResult<U256> {
    match db.get_storage(&vx_pledge_key(addr))? {
        None => Ok(U256::zero()),
        Some(raw) => decode(&raw),
    }
}

pub fn set_vx_pledge(db: &mut VmDb, addr: &Address, amount: U256) {
    let key = vx_pledge_key(addr);
    if amount.is_zero() {
        db.delete_storage(key);
    } else {
        db.set_storage(key, rlp::encode(&amount).to_vec());
    }
}

pub fn get_vip(db: &VmDb, addr: &Address) -> VmResult<Option<PledgeVip>> {
    match db.get_storage(&vip_key(addr))? {
        None => Ok(None),
        Some(raw) => decode(&raw).map(Some),
    }
}

pub fn last_settled_period(db: &VmDb, key: &[u8]) -> VmResult<u64> {
    match db.get_storage(key)? {
        None => Ok(0),
        Some(raw) => decode(&raw),
    }
}

// Order arithmetic.

/// `amount = quantity * price / PRICE_FACTOR`, rescaled from trade-token
/// decimals to quote-token decimals.
pub fn calculate_raw_amount(
    quantity: U256, price: U256, trade_decimals: u8, quote_decimals: u8,
) -> U256 {
    let raw = quantity * price / U256::from(PRICE_FACTOR);
    if trade_decimals > quote_decimals {
        raw / U256::from(10u64).pow(U256::from(trade_decimals - quote_decimals))
    } else {
        raw * U256::from(10u64).pow(U256::from(quote_decimals - trade_decimals))
    }
}

pub fn amount_for_rate(amount: U256, rate: u32) -> U256 {
    amount * U256::from(rate) / U256::from(RATE_FACTOR)
}

/// Worst-case total fee rate an order can pay.
pub fn max_total_fee_rate(order: &Order) -> u32 {
    let taker_rate = order.taker_fee_rate + order.taker_broker_fee_rate;
    let maker_rate = order.maker_fee_rate + order.maker_broker_fee_rate;
    taker_rate.max(maker_rate)
}

pub fn valid_broker_fee_rate(rate: u32) -> bool {
    rate <= MAX_BROKER_FEE_RATE
}

// Fund-conservation verifier.

#[derive(Debug, Clone)]
pub struct FundVerifyItem {
    pub token: TokenId,
    pub balance: U256,
    pub user_amount: U256,
    pub fee_amount: U256,
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct FundVerifyResult {
    pub user_count: usize,
    pub ok: bool,
    pub items: Vec<FundVerifyItem>,
}

/// Checks that, per token, the custodied user funds plus undistributed fee
/// pools equal the contract's actual balance.
pub fn verify_fund_balance(db: &VmDb) -> VmResult<FundVerifyResult> {
    use std::collections::HashMap;

    let mut user_amounts: HashMap<TokenId, U256> = HashMap::new();
    let mut user_count = 0usize;
    for (_, raw) in db.new_storage_iterator(FUND_KEY_PREFIX)? {
        let fund: UserFund = decode(&raw)?;
        for account in &fund.accounts {
            let sum = user_amounts.entry(account.token).or_default();
            *sum = *sum + account.available + account.locked;
        }
        user_count += 1;
    }

    let mut fee_amounts: HashMap<TokenId, U256> = HashMap::new();
    for (_, raw) in db.new_storage_iterator(FEE_SUM_KEY_PREFIX)? {
        let fee_sum: FeeSumByPeriod = decode(&raw)?;
        if fee_sum.finish_fee_dividend {
            continue;
        }
        for fee in &fee_sum.fees {
            let sum = fee_amounts.entry(fee.token).or_default();
            *sum = *sum + fee.dividend_pool;
        }
    }
    for (_, raw) in db.new_storage_iterator(BROKER_FEE_KEY_PREFIX)? {
        let accounts: Vec<BrokerFeeAccount> = rlp::Rlp::new(&raw)
            .as_list()
            .map_err(|e| VmError::State(e.to_string()))?;
        for account in &accounts {
            let sum = fee_amounts.entry(account.token).or_default();
            *sum = *sum + account.amount;
        }
    }

    let mut tokens: Vec<TokenId> = user_amounts
        .keys()
        .chain(fee_amounts.keys())
        .copied()
        .collect();
    tokens.sort();
    tokens.dedup();

    let mut items = Vec::with_capacity(tokens.len());
    let mut all_ok = true;
    for token in tokens {
        let user_amount =
            user_amounts.get(&token).copied().unwrap_or_default();
        let fee_amount = fee_amounts.get(&token).copied().unwrap_or_default();
        let balance = db.get_balance(&token)?;
        let ok = user_amount + fee_amount == balance;
        all_ok &= ok;
        items.push(FundVerifyItem {
            token,
            balance,
            user_amount,
            fee_amount,
            ok,
        });
    }
    Ok(FundVerifyResult { user_count, ok: all_ok, items })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_fund_keeps_one_account_per_token() {
        let mut fund = UserFund::default();
        let token = TokenId([1; 10]);
        fund.account_mut(&token).available = U256::from(5);
        fund.account_mut(&token).available = U256::from(9);
        assert_eq!(fund.accounts.len(), 1);
        assert_eq!(fund.account(&token).unwrap().available, U256::from(9));
    }

    #[test]
    fn raw_amount_rescales_decimals() {
        // 2.0 trade tokens (18 decimals) at price 3.0 into a 6-decimal
        // quote: expect 6.0 quote units.
        let quantity = U256::from(2u64) * U256::from(10u64).pow(18.into());
        let price = U256::from(3u64) * U256::from(PRICE_FACTOR);
        let amount = calculate_raw_amount(quantity, price, 18, 6);
        assert_eq!(amount, U256::from(6u64) * U256::from(10u64).pow(6.into()));
    }

    #[test]
    fn max_total_fee_rate_takes_the_larger_side() {
        let mut order = Order {
            id: 1,
            market_id: 1,
            address: Address::default(),
            side: SIDE_BUY,
            order_type: ORDER_TYPE_LIMIT,
            price: U256::zero(),
            quantity: U256::zero(),
            amount: U256::zero(),
            locked_buy_fee: U256::zero(),
            status: ORDER_STATUS_PENDING,
            executed_quantity: U256::zero(),
            executed_amount: U256::zero(),
            taker_fee_rate: 200,
            taker_broker_fee_rate: 0,
            maker_fee_rate: 250,
            maker_broker_fee_rate: 100,
            timestamp: 0,
        };
        assert_eq!(max_total_fee_rate(&order), 350);
        order.taker_broker_fee_rate = 300;
        assert_eq!(max_total_fee_rate(&order), 500);
    }
}

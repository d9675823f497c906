// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Executor scenarios: exchange order locking, out-of-quota refunds, and
//! the asynchronous market-opening flow across DexFund, Mintage and
//! DexTrade.

use lattice_chain_db::Store;
use lattice_executor::{
    abi,
    builtin::{
        dex::{fund, state as dex_state},
        mintage, pledge, ContractRegistry, DEX_FUND_CONTRACT_ADDRESS,
        DEX_TRADE_CONTRACT_ADDRESS, MINTAGE_CONTRACT_ADDRESS,
        PLEDGE_CONTRACT_ADDRESS,
    },
    FixedPeriodReader, ReceiveOutcome, Vm, VmConfig, VmEnv, VmError,
    VmOutput, RESULT_FAIL,
};
use lattice_statedb::{StateDb, VmAccountBlock, VmDb, VmDbContext};
use lattice_types::{
    Address, Hash, HashHeight, TokenId, U256, ADDRESS_TAG_USER,
    NATIVE_TOKEN_ID,
};
use primitives::{AccountBlock, BlockType};
use std::{collections::HashMap, sync::Arc};

const SNAPSHOT_HEIGHT: u64 = 1_000;
const SNAPSHOT_TIMESTAMP: u64 = 1_600_000_000;

struct Harness {
    state: Arc<StateDb>,
    vm: Vm,
    consensus: FixedPeriodReader,
    heads: HashMap<Address, (u64, Hash)>,
    snapshot_timestamp: u64,
}

impl Harness {
    fn new(config: VmConfig) -> Self {
        let state = Arc::new(StateDb::new(Arc::new(Store::new(
            Arc::new(kvdb_memorydb::create(1)),
            "state",
        ))));
        Harness {
            state,
            vm: Vm::new(config, Arc::new(ContractRegistry::standard())),
            // Period 1 starts at the harness's initial snapshot time.
            consensus: FixedPeriodReader::new(
                SNAPSHOT_TIMESTAMP - 3_600,
                3_600,
            ),
            heads: HashMap::new(),
            snapshot_timestamp: SNAPSHOT_TIMESTAMP,
        }
    }

    fn test_vm() -> Self {
        Harness::new(VmConfig { is_test: true, ..Default::default() })
    }

    fn ctx(&self, addr: &Address) -> VmDbContext {
        VmDbContext {
            prev_account_block: self.heads.get(addr).map(|(height, hash)| {
                HashHeight { hash: *hash, height: *height }
            }),
            latest_snapshot: HashHeight {
                hash: Hash::repeat_byte(0x55),
                height: SNAPSHOT_HEIGHT,
            },
            snapshot_timestamp: self.snapshot_timestamp,
            call_depth: 0,
            unconfirmed_count: 0,
        }
    }

    fn vm_db(&self, addr: Address) -> VmDb {
        self.state.new_vm_db(addr, self.ctx(&addr))
    }

    fn seed_balance(&mut self, owner: Address, token: TokenId, amount: u64) {
        let mut db = self.vm_db(owner);
        db.add_balance(&token, U256::from(amount)).unwrap();
        let mut faucet = AccountBlock {
            block_type: BlockType::Receive,
            account_address: owner,
            data: token.as_bytes().to_vec(),
            ..Default::default()
        };
        faucet.seal();
        self.state
            .write_block(&VmAccountBlock { block: faucet, state: db })
            .unwrap();
    }

    fn commit(&mut self, vab: &VmAccountBlock) {
        self.state.write_block(vab).unwrap();
        let block = &vab.block;
        let head = match block.send_block_list.last() {
            Some(child) => {
                (block.height + block.send_block_list.len() as u64, child.hash)
            }
            None => (block.height, block.hash),
        };
        self.heads.insert(block.account_address, head);
    }

    fn run_send(
        &mut self, from: Address, to: Address, amount: u64, token: TokenId,
        data: Vec<u8>,
    ) -> AccountBlock {
        self.run_send_typed(from, to, BlockType::SendCall, amount, token, data)
    }

    fn run_send_typed(
        &mut self, from: Address, to: Address, block_type: BlockType,
        amount: u64, token: TokenId, data: Vec<u8>,
    ) -> AccountBlock {
        let (height, prev) =
            self.heads.get(&from).copied().unwrap_or((0, Hash::zero()));
        let block = AccountBlock {
            block_type,
            account_address: from,
            to_address: to,
            amount: U256::from(amount),
            token_id: token,
            height: height + 1,
            prev_hash: prev,
            data,
            ..Default::default()
        };
        let db = self.vm_db(from);
        let env = VmEnv::new(&self.consensus);
        let output = self.vm.run(db, block, None, &env).unwrap();
        match output {
            VmOutput::Send(vab) => {
                self.commit(&vab);
                vab.block
            }
            VmOutput::Receive(_) => unreachable!("send produced a receive"),
        }
    }

    fn run_receive(&mut self, send: &AccountBlock) -> ReceiveOutcome {
        let target = send.to_address;
        let (height, prev) =
            self.heads.get(&target).copied().unwrap_or((0, Hash::zero()));
        let block = AccountBlock {
            block_type: BlockType::Receive,
            account_address: target,
            from_block_hash: send.hash,
            height: height + 1,
            prev_hash: prev,
            ..Default::default()
        };
        let db = self.vm_db(target);
        let env = VmEnv::new(&self.consensus);
        let output = self.vm.run(db, block, Some(send), &env).unwrap();
        let outcome = match output {
            VmOutput::Receive(outcome) => outcome,
            VmOutput::Send(_) => unreachable!("receive produced a send"),
        };
        match &outcome {
            ReceiveOutcome::Committed(vab)
            | ReceiveOutcome::FailedTerminal { block: vab, .. } => {
                self.commit(vab)
            }
            ReceiveOutcome::RetryLater(_) => {}
        }
        outcome
    }

    fn user_fund(&self, owner: &Address) -> dex_state::UserFund {
        let raw = self
            .state
            .get_storage(&DEX_FUND_CONTRACT_ADDRESS, &dex_state::fund_key(owner))
            .unwrap();
        match raw {
            None => Default::default(),
            Some(raw) => rlp::decode(&raw).unwrap(),
        }
    }

    fn market(
        &self, trade: &TokenId, quote: &TokenId,
    ) -> Option<dex_state::MarketInfo> {
        self.state
            .get_storage(
                &DEX_FUND_CONTRACT_ADDRESS,
                &dex_state::market_key(trade, quote),
            )
            .unwrap()
            .map(|raw| rlp::decode(&raw).unwrap())
    }
}

fn user(n: u8) -> Address { Address::from_id([n; 20], ADDRESS_TAG_USER) }

fn committed(outcome: ReceiveOutcome) -> AccountBlock {
    match outcome {
        ReceiveOutcome::Committed(vab) => vab.block,
        ReceiveOutcome::FailedTerminal { error, .. } => {
            panic!("receive failed: {}", error)
        }
        ReceiveOutcome::RetryLater(reason) => {
            panic!("receive deferred: {:?}", reason)
        }
    }
}

const TOKEN_T: TokenId = TokenId([0x11; 10]);

/// Mints `token` and completes a `token`/native market through the
/// pending-market + token-info-callback flow.
fn open_market(harness: &mut Harness, owner: Address, token: TokenId) {
    harness.seed_balance(owner, NATIVE_TOKEN_ID, 10_000_000_000);

    let mint = harness.run_send(
        owner,
        *MINTAGE_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(mintage::SIG_MINT),
            &mintage::MintParams {
                token_id: token,
                symbol: "TST".into(),
                decimals: 18,
                total_supply: U256::from(1_000_000u64),
            },
        ),
    );
    let mint_receive = committed(harness.run_receive(&mint));
    assert_eq!(mint_receive.send_block_list.len(), 1);

    let new_market = harness.run_send(
        owner,
        *DEX_FUND_CONTRACT_ADDRESS,
        dex_state::NEW_MARKET_FEE,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_NEW_MARKET),
            &fund::NewMarketParams {
                trade_token: token,
                quote_token: NATIVE_TOKEN_ID,
            },
        ),
    );
    let market_receive = committed(harness.run_receive(&new_market));
    // Market parked as invalid, token info requested from Mintage.
    assert!(!harness.market(&token, &NATIVE_TOKEN_ID).unwrap().valid);
    let query = market_receive.send_block_list[0].clone();
    assert_eq!(query.to_address, *MINTAGE_CONTRACT_ADDRESS);

    let query_receive = committed(harness.run_receive(&query));
    let callback = query_receive.send_block_list[0].clone();
    assert_eq!(callback.to_address, *DEX_FUND_CONTRACT_ADDRESS);

    let callback_receive = committed(harness.run_receive(&callback));
    let market = harness.market(&token, &NATIVE_TOKEN_ID).unwrap();
    assert!(market.valid);
    // The validated market is advertised to DexTrade.
    let notify = callback_receive.send_block_list[0].clone();
    assert_eq!(notify.to_address, *DEX_TRADE_CONTRACT_ADDRESS);
    committed(harness.run_receive(&notify));
}

#[test]
fn new_market_async_flow_validates_market() {
    let mut harness = Harness::test_vm();
    open_market(&mut harness, user(1), TOKEN_T);
    let market = harness.market(&TOKEN_T, &NATIVE_TOKEN_ID).unwrap();
    assert!(market.market_id > 0);
    assert!(market.market_symbol.starts_with("TST"));
}

#[test]
fn new_market_unknown_token_refunds_creator() {
    let mut harness = Harness::test_vm();
    let creator = user(1);
    harness.seed_balance(creator, NATIVE_TOKEN_ID, 10_000_000_000);

    let unknown = TokenId([0x22; 10]);
    let new_market = harness.run_send(
        creator,
        *DEX_FUND_CONTRACT_ADDRESS,
        dex_state::NEW_MARKET_FEE,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_NEW_MARKET),
            &fund::NewMarketParams {
                trade_token: unknown,
                quote_token: NATIVE_TOKEN_ID,
            },
        ),
    );
    let market_receive = committed(harness.run_receive(&new_market));
    let query = market_receive.send_block_list[0].clone();
    let query_receive = committed(harness.run_receive(&query));
    let callback = query_receive.send_block_list[0].clone();

    let callback_receive = committed(harness.run_receive(&callback));
    assert!(harness.market(&unknown, &NATIVE_TOKEN_ID).is_none());
    let refund = callback_receive.send_block_list[0].clone();
    assert_eq!(refund.to_address, creator);
    assert_eq!(refund.amount, U256::from(dex_state::NEW_MARKET_FEE));
    assert_eq!(refund.token_id, NATIVE_TOKEN_ID);
}

#[test]
fn order_lock_underflow_is_rejected_and_state_unchanged() {
    let mut harness = Harness::test_vm();
    let trader = user(2);
    open_market(&mut harness, user(1), TOKEN_T);

    harness.seed_balance(trader, TOKEN_T, 10);
    harness.seed_balance(trader, NATIVE_TOKEN_ID, 1_000_000);
    let deposit = harness.run_send(
        trader,
        *DEX_FUND_CONTRACT_ADDRESS,
        10,
        TOKEN_T,
        abi::method_selector(fund::SIG_DEPOSIT).to_vec(),
    );
    committed(harness.run_receive(&deposit));
    assert_eq!(
        harness.user_fund(&trader).account(&TOKEN_T).unwrap().available,
        U256::from(10)
    );

    // Sell 15 with only 10 available.
    let order = harness.run_send(
        trader,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_NEW_ORDER),
            &fund::NewOrderParams {
                trade_token: TOKEN_T,
                quote_token: NATIVE_TOKEN_ID,
                side: dex_state::SIDE_SELL,
                order_type: dex_state::ORDER_TYPE_LIMIT,
                price: U256::from(dex_state::PRICE_FACTOR),
                quantity: U256::from(15),
            },
        ),
    );
    match harness.run_receive(&order) {
        ReceiveOutcome::FailedTerminal { error, block } => {
            assert_eq!(error, VmError::ExceedFundAvailable);
            assert_eq!(block.block.block_type, BlockType::ReceiveError);
        }
        _ => panic!("order should fail terminally"),
    }
    let fund = harness.user_fund(&trader);
    let account = fund.account(&TOKEN_T).unwrap();
    assert_eq!(account.available, U256::from(10));
    assert_eq!(account.locked, U256::zero());
}

#[test]
fn valid_order_locks_funds_and_reaches_trade_book() {
    let mut harness = Harness::test_vm();
    let trader = user(2);
    open_market(&mut harness, user(1), TOKEN_T);

    harness.seed_balance(trader, TOKEN_T, 1_000_000);
    let deposit = harness.run_send(
        trader,
        *DEX_FUND_CONTRACT_ADDRESS,
        1_000_000,
        TOKEN_T,
        abi::method_selector(fund::SIG_DEPOSIT).to_vec(),
    );
    committed(harness.run_receive(&deposit));

    let order_send = harness.run_send(
        trader,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_NEW_ORDER),
            &fund::NewOrderParams {
                trade_token: TOKEN_T,
                quote_token: NATIVE_TOKEN_ID,
                side: dex_state::SIDE_SELL,
                order_type: dex_state::ORDER_TYPE_LIMIT,
                price: U256::from(dex_state::PRICE_FACTOR),
                quantity: U256::from(500_000),
            },
        ),
    );
    let receive = committed(harness.run_receive(&order_send));
    let fund = harness.user_fund(&trader);
    let account = fund.account(&TOKEN_T).unwrap();
    assert_eq!(account.available, U256::from(500_000));
    assert_eq!(account.locked, U256::from(500_000));

    // The rendered order flows to DexTrade and lands in the book.
    let to_trade = receive.send_block_list[0].clone();
    committed(harness.run_receive(&to_trade));
    let order: dex_state::Order = abi::decode_params(&to_trade.data).unwrap();
    let booked = harness
        .state
        .get_storage(
            &DEX_TRADE_CONTRACT_ADDRESS,
            &dex_state::order_key(order.market_id, order.id),
        )
        .unwrap();
    assert!(booked.is_some());
}

#[test]
fn settle_orders_is_dex_trade_only_and_conserves_funds() {
    let mut harness = Harness::test_vm();
    let (maker, taker) = (user(2), user(3));
    open_market(&mut harness, user(1), TOKEN_T);

    for trader in [maker, taker] {
        harness.seed_balance(trader, NATIVE_TOKEN_ID, 1_000_000);
        let deposit = harness.run_send(
            trader,
            *DEX_FUND_CONTRACT_ADDRESS,
            1_000_000,
            NATIVE_TOKEN_ID,
            abi::method_selector(fund::SIG_DEPOSIT).to_vec(),
        );
        committed(harness.run_receive(&deposit));
    }

    // The maker's buy order locks 10000 quote plus the fee reserve.
    let order_send = harness.run_send(
        maker,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_NEW_ORDER),
            &fund::NewOrderParams {
                trade_token: TOKEN_T,
                quote_token: NATIVE_TOKEN_ID,
                side: dex_state::SIDE_BUY,
                order_type: dex_state::ORDER_TYPE_LIMIT,
                price: U256::from(dex_state::PRICE_FACTOR),
                quantity: U256::from(10_000u64),
            },
        ),
    );
    committed(harness.run_receive(&order_send));
    let locked_before =
        harness.user_fund(&maker).account(&NATIVE_TOKEN_ID).unwrap().locked;
    assert_eq!(locked_before, U256::from(10_020u64));

    let actions = dex_state::SettleActions {
        fund_actions: vec![
            dex_state::UserFundSettle {
                address: maker,
                settles: vec![dex_state::FundSettle {
                    token: NATIVE_TOKEN_ID,
                    deduce_locked: U256::from(10_000u64),
                    release_locked: U256::zero(),
                    inc_available: U256::zero(),
                }],
            },
            dex_state::UserFundSettle {
                address: taker,
                settles: vec![dex_state::FundSettle {
                    token: NATIVE_TOKEN_ID,
                    deduce_locked: U256::zero(),
                    release_locked: U256::zero(),
                    inc_available: U256::from(9_990u64),
                }],
            },
        ],
        fee_actions: vec![dex_state::FeeSettle {
            token: NATIVE_TOKEN_ID,
            broker: user(9),
            user_fees: vec![dex_state::UserFeeSettle {
                address: taker,
                base_fee: U256::from(8u64),
                broker_fee: U256::from(2u64),
            }],
        }],
    };

    // A user impersonating DexTrade is rejected.
    let mut fake = AccountBlock {
        block_type: BlockType::SendCall,
        account_address: taker,
        to_address: *DEX_FUND_CONTRACT_ADDRESS,
        token_id: NATIVE_TOKEN_ID,
        height: 90,
        data: abi::encode_call(
            abi::method_selector(fund::SIG_SETTLE_ORDERS),
            &actions,
        ),
        ..Default::default()
    };
    fake.seal();
    match harness.run_receive(&fake) {
        ReceiveOutcome::FailedTerminal { error, .. } => {
            assert_eq!(error, VmError::InvalidSourceAddress)
        }
        _ => panic!("settle from user must fail"),
    }

    // The genuine settlement: 10000 leaves the maker's lock, 9990 reaches
    // the taker, 10 becomes period and broker fees.
    let mut settle = AccountBlock {
        block_type: BlockType::SendCall,
        account_address: *DEX_TRADE_CONTRACT_ADDRESS,
        to_address: *DEX_FUND_CONTRACT_ADDRESS,
        token_id: NATIVE_TOKEN_ID,
        height: 91,
        data: abi::encode_call(
            abi::method_selector(fund::SIG_SETTLE_ORDERS),
            &actions,
        ),
        ..Default::default()
    };
    settle.seal();
    committed(harness.run_receive(&settle));

    let maker_fund = harness.user_fund(&maker);
    assert_eq!(
        maker_fund.account(&NATIVE_TOKEN_ID).unwrap().locked,
        U256::from(20u64)
    );
    assert_eq!(
        harness
            .user_fund(&taker)
            .account(&NATIVE_TOKEN_ID)
            .unwrap()
            .available,
        U256::from(1_009_990u64)
    );

    // Custodied funds plus fee pools still equal the contract balance.
    let db = harness.vm_db(*DEX_FUND_CONTRACT_ADDRESS);
    let verify = dex_state::verify_fund_balance(&db).unwrap();
    assert!(verify.ok, "fund conservation broken: {:?}", verify.items);
}

#[test]
fn out_of_quota_receive_refunds_amount_and_fee_together() {
    // Setup runs under test quota; the scenario itself uses real quota.
    let mut setup = Harness::test_vm();
    let owner = user(1);
    setup.seed_balance(owner, NATIVE_TOKEN_ID, 100_000_000_000);

    // Create a contract with 100 bytes of code.
    let create = setup.run_send_typed(
        owner,
        Address::default(),
        BlockType::SendCreate,
        0,
        NATIVE_TOKEN_ID,
        lattice_executor::make_create_data(1, 0, &[0xab; 100]),
    );
    let contract = create.to_address;
    assert!(contract.is_contract());
    committed(setup.run_receive(&create));

    // Fund the contract's quota: enough for intrinsic gas, not for the
    // code execution charge.
    let pledge = setup.run_send(
        owner,
        *PLEDGE_CONTRACT_ADDRESS,
        220_000_000,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(pledge::SIG_PLEDGE),
            &pledge::PledgeParams { beneficiary: contract },
        ),
    );
    committed(setup.run_receive(&pledge));

    let mut harness = setup;
    harness.vm = Vm::new(
        VmConfig { is_test: false, ..Default::default() },
        Arc::new(ContractRegistry::standard()),
    );

    // Amount 5 + fee 1, both native: one merged refund of 6.
    let mut send = AccountBlock {
        block_type: BlockType::SendCall,
        account_address: owner,
        to_address: contract,
        amount: U256::from(5u64),
        fee: U256::from(1u64),
        token_id: NATIVE_TOKEN_ID,
        height: 99,
        ..Default::default()
    };
    send.seal();

    match harness.run_receive(&send) {
        ReceiveOutcome::FailedTerminal { error, block } => {
            assert_eq!(error, VmError::OutOfQuota);
            let receive = &block.block;
            assert_eq!(receive.block_type, BlockType::ReceiveError);
            assert_eq!(*receive.data.last().unwrap(), RESULT_FAIL);
            assert_eq!(receive.send_block_list.len(), 1);
            let refund = &receive.send_block_list[0];
            assert_eq!(refund.block_type, BlockType::SendRefund);
            assert_eq!(refund.amount, U256::from(6u64));
            assert_eq!(refund.token_id, NATIVE_TOKEN_ID);
            assert_eq!(refund.to_address, owner);
        }
        _ => panic!("receive should fail terminally"),
    }
    // Reverted: the contract kept nothing of the transfer.
    assert_eq!(
        harness
            .state
            .get_balance(&contract, &NATIVE_TOKEN_ID)
            .unwrap(),
        U256::zero()
    );
}

#[test]
fn out_of_quota_with_earlier_unconfirmed_blocks_retries() {
    let mut setup = Harness::test_vm();
    let owner = user(1);
    setup.seed_balance(owner, NATIVE_TOKEN_ID, 100_000_000_000);
    let create = setup.run_send_typed(
        owner,
        Address::default(),
        BlockType::SendCreate,
        0,
        NATIVE_TOKEN_ID,
        lattice_executor::make_create_data(1, 0, &[0xab; 100]),
    );
    let contract = create.to_address;
    committed(setup.run_receive(&create));
    let pledge = setup.run_send(
        owner,
        *PLEDGE_CONTRACT_ADDRESS,
        220_000_000,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(pledge::SIG_PLEDGE),
            &pledge::PledgeParams { beneficiary: contract },
        ),
    );
    committed(setup.run_receive(&pledge));

    let mut send = AccountBlock {
        block_type: BlockType::SendCall,
        account_address: owner,
        to_address: contract,
        amount: U256::from(5u64),
        token_id: NATIVE_TOKEN_ID,
        height: 99,
        ..Default::default()
    };
    send.seal();

    let vm = Vm::new(
        VmConfig { is_test: false, ..Default::default() },
        Arc::new(ContractRegistry::standard()),
    );
    let mut ctx = setup.ctx(&contract);
    ctx.unconfirmed_count = 1;
    let db = setup.state.new_vm_db(contract, ctx);
    let block = AccountBlock {
        block_type: BlockType::Receive,
        account_address: contract,
        from_block_hash: send.hash,
        height: 2,
        ..Default::default()
    };
    let env = VmEnv::new(&setup.consensus);
    match vm.run(db, block, Some(&send), &env).unwrap() {
        VmOutput::Receive(ReceiveOutcome::RetryLater(reason)) => {
            assert_eq!(
                reason,
                lattice_executor::RetryReason::OutOfQuotaNotFirst
            );
        }
        _ => panic!("expected retry"),
    }
}

#[test]
fn call_depth_limit_fails_with_depth_result() {
    let mut harness = Harness::test_vm();
    let owner = user(1);
    harness.seed_balance(owner, NATIVE_TOKEN_ID, 1_000);

    let mut send = AccountBlock {
        block_type: BlockType::SendCall,
        account_address: owner,
        to_address: user(2),
        amount: U256::from(1u64),
        token_id: NATIVE_TOKEN_ID,
        height: 1,
        ..Default::default()
    };
    send.seal();

    let mut ctx = harness.ctx(&user(2));
    ctx.call_depth = harness.vm.config().call_depth_limit;
    let db = harness.state.new_vm_db(user(2), ctx);
    let block = AccountBlock {
        block_type: BlockType::Receive,
        account_address: user(2),
        from_block_hash: send.hash,
        height: 1,
        ..Default::default()
    };
    let env = VmEnv::new(&harness.consensus);
    match harness.vm.run(db, block, Some(&send), &env).unwrap() {
        VmOutput::Receive(ReceiveOutcome::FailedTerminal {
            error,
            block,
        }) => {
            assert_eq!(error, VmError::Depth);
            assert_eq!(
                *block.block.data.last().unwrap(),
                lattice_executor::RESULT_DEPTH
            );
        }
        _ => panic!("expected depth failure"),
    }
}

#[test]
fn fee_dividend_flows_to_vx_stakers_through_pledge_callbacks() {
    let mut harness = Harness::test_vm();
    let (owner, staker) = (user(1), user(4));
    open_market(&mut harness, owner, TOKEN_T);

    // The exchange owner bootstraps itself.
    let config = harness.run_send(
        owner,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_OWNER_CONFIG),
            &fund::OwnerConfigParams { owner },
        ),
    );
    committed(harness.run_receive(&config));

    // The staker deposits and stakes for VX; the stake travels to the
    // Pledge contract and confirms through a callback send.
    harness.seed_balance(staker, NATIVE_TOKEN_ID, 1_000_000);
    let deposit = harness.run_send(
        staker,
        *DEX_FUND_CONTRACT_ADDRESS,
        1_000_000,
        NATIVE_TOKEN_ID,
        abi::method_selector(fund::SIG_DEPOSIT).to_vec(),
    );
    committed(harness.run_receive(&deposit));

    let stake = harness.run_send(
        staker,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_PLEDGE_FOR_VX),
            &fund::PledgeForVxParams {
                action_type: 1,
                amount: U256::from(100_000u64),
            },
        ),
    );
    let stake_receive = committed(harness.run_receive(&stake));
    let to_pledge = stake_receive.send_block_list[0].clone();
    assert_eq!(to_pledge.to_address, *PLEDGE_CONTRACT_ADDRESS);
    assert_eq!(to_pledge.amount, U256::from(100_000u64));

    let pledge_receive = committed(harness.run_receive(&to_pledge));
    let callback = pledge_receive.send_block_list[0].clone();
    assert_eq!(callback.to_address, *DEX_FUND_CONTRACT_ADDRESS);
    committed(harness.run_receive(&callback));

    // Fees settle into the current period (period 1).
    let actions = dex_state::SettleActions {
        fund_actions: Vec::new(),
        fee_actions: vec![dex_state::FeeSettle {
            token: NATIVE_TOKEN_ID,
            broker: user(9),
            user_fees: vec![dex_state::UserFeeSettle {
                address: staker,
                base_fee: U256::from(1_000u64),
                broker_fee: U256::zero(),
            }],
        }],
    };
    let mut settle = AccountBlock {
        block_type: BlockType::SendCall,
        account_address: *DEX_TRADE_CONTRACT_ADDRESS,
        to_address: *DEX_FUND_CONTRACT_ADDRESS,
        token_id: NATIVE_TOKEN_ID,
        height: 90,
        data: abi::encode_call(
            abi::method_selector(fund::SIG_SETTLE_ORDERS),
            &actions,
        ),
        ..Default::default()
    };
    settle.seal();
    committed(harness.run_receive(&settle));

    // Dividends for a period still running are refused.
    let early = harness.run_send(
        owner,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_FEE_DIVIDEND),
            &fund::PeriodParams { period_id: 1 },
        ),
    );
    match harness.run_receive(&early) {
        ReceiveOutcome::FailedTerminal { error, .. } => {
            assert_eq!(
                error,
                VmError::Contract("period not finished".into())
            )
        }
        _ => panic!("dividend of the running period must fail"),
    }

    // One period later the owner distributes; the sole staker takes the
    // whole native pool: the market-opening fee plus the settled trade
    // fees.
    harness.snapshot_timestamp += 3_600;
    let available_before = harness
        .user_fund(&staker)
        .account(&NATIVE_TOKEN_ID)
        .unwrap()
        .available;
    let dividend = harness.run_send(
        owner,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_FEE_DIVIDEND),
            &fund::PeriodParams { period_id: 1 },
        ),
    );
    committed(harness.run_receive(&dividend));
    let available_after = harness
        .user_fund(&staker)
        .account(&NATIVE_TOKEN_ID)
        .unwrap()
        .available;
    assert_eq!(
        available_after - available_before,
        U256::from(dex_state::NEW_MARKET_FEE + 1_000)
    );

    // Replaying the same period is refused.
    let replay = harness.run_send(
        owner,
        *DEX_FUND_CONTRACT_ADDRESS,
        0,
        NATIVE_TOKEN_ID,
        abi::encode_call(
            abi::method_selector(fund::SIG_FEE_DIVIDEND),
            &fund::PeriodParams { period_id: 1 },
        ),
    );
    match harness.run_receive(&replay) {
        ReceiveOutcome::FailedTerminal { error, .. } => {
            assert_eq!(
                error,
                VmError::Contract("period id not consecutive".into())
            )
        }
        _ => panic!("dividend replay must fail"),
    }
}

#[test]
fn large_contract_create_stores_code() {
    let mut harness = Harness::test_vm();
    let owner = user(1);
    harness.seed_balance(owner, NATIVE_TOKEN_ID, 100_000_000_000);

    // Well past the ~235-byte floor of the old create economics and still
    // under the size cap.
    let code = vec![0xcd; 20_000];
    let create = harness.run_send_typed(
        owner,
        Address::default(),
        BlockType::SendCreate,
        0,
        NATIVE_TOKEN_ID,
        lattice_executor::make_create_data(1, 0, &code),
    );
    let contract = create.to_address;
    committed(harness.run_receive(&create));

    let (_, stored) = harness.state.get_code(&contract).unwrap().unwrap();
    assert_eq!(stored.len(), code.len());
    assert_eq!(stored, code);
}

#[test]
fn oversized_create_is_rejected_at_send() {
    let mut harness = Harness::test_vm();
    let owner = user(1);
    harness.seed_balance(owner, NATIVE_TOKEN_ID, 100_000_000_000);

    let oversized = vec![0xcd; harness.vm.config().max_code_size + 1];
    let block = AccountBlock {
        block_type: BlockType::SendCreate,
        account_address: owner,
        amount: U256::zero(),
        token_id: NATIVE_TOKEN_ID,
        height: 1,
        data: lattice_executor::make_create_data(1, 0, &oversized),
        ..Default::default()
    };
    let db = harness.vm_db(owner);
    let env = VmEnv::new(&harness.consensus);
    assert_eq!(
        harness.vm.run(db, block, None, &env).err(),
        Some(VmError::CodeSizeLimit)
    );
    // Nothing was committed; the balance is untouched.
    assert_eq!(
        harness
            .state
            .get_balance(&owner, &NATIVE_TOKEN_ID)
            .unwrap(),
        U256::from(100_000_000_000u64)
    );
}

#[test]
fn underfunded_create_receive_fails_terminally_with_refund() {
    let mut harness = Harness::test_vm();
    let owner = user(1);

    // A create whose fee funds less quota than the intrinsic create gas;
    // admitted externally, it must still produce a receive block and give
    // amount + fee back in one merged native refund.
    let mut send = AccountBlock {
        block_type: BlockType::SendCreate,
        account_address: owner,
        to_address: user(7),
        amount: U256::from(5u64),
        fee: U256::from(100_000u64),
        token_id: NATIVE_TOKEN_ID,
        height: 1,
        data: lattice_executor::make_create_data(1, 0, &[0xcd; 16]),
        ..Default::default()
    };
    send.seal();

    match harness.run_receive(&send) {
        ReceiveOutcome::FailedTerminal { error, block } => {
            assert_eq!(error, VmError::OutOfQuota);
            let receive = &block.block;
            assert_eq!(receive.block_type, BlockType::ReceiveError);
            assert_eq!(*receive.data.last().unwrap(), RESULT_FAIL);
            assert_eq!(receive.send_block_list.len(), 1);
            let refund = &receive.send_block_list[0];
            assert_eq!(refund.block_type, BlockType::SendRefund);
            assert_eq!(refund.amount, U256::from(100_005u64));
            assert_eq!(refund.token_id, NATIVE_TOKEN_ID);
            assert_eq!(refund.to_address, owner);
        }
        _ => panic!("underfunded create must fail terminally"),
    }
    // Reverted and refunded: the would-be contract kept nothing.
    assert_eq!(
        harness
            .state
            .get_balance(&user(7), &NATIVE_TOKEN_ID)
            .unwrap(),
        U256::zero()
    );
}

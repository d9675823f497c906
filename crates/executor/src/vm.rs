// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! The send/receive transaction executor. Dispatches on block type, charges
//! quota, runs built-in contract methods, emits refunds on failure, and
//! packages the executed block together with its state delta.

use crate::{
    builtin::{ContractRegistry, CONSENSUS_GROUP_CONTRACT_ADDRESS,
              MINTAGE_CONTRACT_ADDRESS},
    env::VmEnv,
    error::{VmError, VmResult},
    quota,
};
use keccak_hash::keccak;
use lattice_statedb::{VmAccountBlock, VmDb};
use lattice_types::{
    Address, Hash, TokenId, U256, ADDRESS_TAG_CONTRACT, NATIVE_TOKEN_ID,
};
use primitives::{AccountBlock, BlockType};
use rlp::RlpStream;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub const RESULT_SUCCESS: u8 = 0;
pub const RESULT_FAIL: u8 = 1;
pub const RESULT_DEPTH: u8 = 2;

pub const CONTRACT_TYPE_PLAIN: u8 = 1;
pub const CONFIRM_TIMES_MAX: u8 = 75;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    /// Grants every block a fixed quota budget instead of consulting the
    /// pledge ledger. Test deployments only.
    pub is_test: bool,
    pub call_depth_limit: u16,
    pub max_code_size: usize,
    pub create_contract_fee: U256,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            is_test: false,
            call_depth_limit: 10,
            max_code_size: 24_576,
            create_contract_fee: U256::from(10_000_000_000u64),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// Intrinsic gas did not fit in the currently available quota; a later
    /// snapshot may fund more.
    IntrinsicQuotaShortage,
    /// Ran out of quota but earlier unconfirmed blocks exist for this
    /// account; retry once they are confirmed.
    OutOfQuotaNotFirst,
}

/// What happened to a receive execution. Failed receives that still commit
/// (with refunds) are `FailedTerminal`; `RetryLater` commits nothing.
pub enum ReceiveOutcome {
    Committed(VmAccountBlock),
    RetryLater(RetryReason),
    FailedTerminal { error: VmError, block: VmAccountBlock },
}

pub enum VmOutput {
    Send(VmAccountBlock),
    Receive(ReceiveOutcome),
}

pub struct Vm {
    config: VmConfig,
    registry: Arc<ContractRegistry>,
    abort: AtomicBool,
}

impl Vm {
    pub fn new(config: VmConfig, registry: Arc<ContractRegistry>) -> Self {
        Vm { config, registry, abort: AtomicBool::new(false) }
    }

    pub fn config(&self) -> &VmConfig { &self.config }

    /// Requests a cooperative abort; execution stops before the next step.
    pub fn cancel(&self) { self.abort.store(true, Ordering::SeqCst); }

    fn check_abort(&self) -> VmResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(VmError::Aborted);
        }
        Ok(())
    }

    /// Entry point: executes `block` against `db`. Receives additionally
    /// take the originating send.
    pub fn run(
        &self, db: VmDb, block: AccountBlock,
        send_block: Option<&AccountBlock>, env: &VmEnv,
    ) -> VmResult<VmOutput> {
        self.check_abort()?;
        debug!(
            "vm run: type {:?} address {} height {}",
            block.block_type, block.account_address, block.height
        );
        match block.block_type {
            BlockType::Receive | BlockType::ReceiveError => {
                let send_block =
                    send_block.ok_or(VmError::InvalidBlockType)?;
                let mut block = block;
                block.data.clear();
                let outcome = match send_block.block_type {
                    BlockType::SendCreate => self.receive_create(
                        db,
                        block,
                        send_block,
                        quota::calc_create_quota(send_block.fee),
                    )?,
                    BlockType::SendCall | BlockType::SendReward => {
                        self.receive_call(db, block, send_block, env)?
                    }
                    BlockType::SendRefund => {
                        self.receive_refund(db, block, send_block)?
                    }
                    _ => return Err(VmError::InvalidBlockType),
                };
                Ok(VmOutput::Receive(outcome))
            }
            BlockType::SendCreate => {
                let (total, addition) =
                    quota::calc_quota(&self.config, &db, block.difficulty)?;
                Ok(VmOutput::Send(
                    self.send_create(db, block, true, total, addition)?,
                ))
            }
            BlockType::SendCall => {
                let (total, addition) =
                    quota::calc_quota(&self.config, &db, block.difficulty)?;
                Ok(VmOutput::Send(
                    self.send_call(db, block, true, total, addition)?,
                ))
            }
            // Reward and refund sends are only generated internally.
            BlockType::SendReward | BlockType::SendRefund => {
                Err(VmError::InvalidBlockType)
            }
        }
    }

    /// Contract-create send: computes the fee, validates the create
    /// payload, derives the contract address, and deducts balance and fee.
    fn send_create(
        &self, mut db: VmDb, mut block: AccountBlock, use_quota: bool,
        quota_total: u64, quota_addition: u64,
    ) -> VmResult<VmAccountBlock> {
        let (contract_type, confirm_times, code) =
            parse_create_data(&block.data)?;
        if contract_type != CONTRACT_TYPE_PLAIN {
            return Err(VmError::InvalidContractType);
        }
        if confirm_times > CONFIRM_TIMES_MAX {
            return Err(VmError::InvalidConfirmTime);
        }
        if code.len() > self.config.max_code_size {
            return Err(VmError::CodeSizeLimit);
        }

        let mut quota_left = quota_total;
        if use_quota {
            let cost = quota::intrinsic_gas_cost(&block.data, true)?;
            quota_left = quota::use_quota(quota_left, cost)?;
        }
        block.fee = self.config.create_contract_fee;

        if !can_transfer(&db, &block.token_id, block.amount, block.fee)? {
            return Err(VmError::InsufficientBalance);
        }

        let contract_addr = new_contract_address(
            &block.account_address,
            block.height,
            &block.prev_hash,
            &db.latest_snapshot().hash,
        );
        block.to_address = contract_addr;
        db.sub_balance(&block.token_id, block.amount)?;
        db.sub_balance(&NATIVE_TOKEN_ID, block.fee)?;
        block.quota = quota::quota_used(
            use_quota,
            quota_total,
            quota_addition,
            quota_left,
            0,
            None,
        );
        block.seal();
        Ok(VmAccountBlock { block, state: db })
    }

    /// Call send: built-in targets validate through `do_send` and charge
    /// their declared quota; plain transfers charge intrinsic gas only.
    fn send_call(
        &self, mut db: VmDb, mut block: AccountBlock, use_quota: bool,
        quota_total: u64, quota_addition: u64,
    ) -> VmResult<VmAccountBlock> {
        self.check_abort()?;
        let mut quota_left = quota_total;
        match self.registry.method_for(&block.to_address, &block.data) {
            Ok(Some(method)) => {
                block.fee = method.fee(&block)?;
                if !can_transfer(&db, &block.token_id, block.amount, block.fee)?
                {
                    return Err(VmError::InsufficientBalance);
                }
                if use_quota {
                    let cost = method.send_quota(&block.data)?;
                    quota_left = quota::use_quota(quota_left, cost)?;
                }
                method.do_send(&mut db, &mut block)?;
                db.sub_balance(&block.token_id, block.amount)?;
                db.sub_balance(&NATIVE_TOKEN_ID, block.fee)?;
            }
            Ok(None) => {
                block.fee = U256::zero();
                if use_quota {
                    let cost = quota::intrinsic_gas_cost(&block.data, false)?;
                    quota_left = quota::use_quota(quota_left, cost)?;
                }
                if !can_transfer(&db, &block.token_id, block.amount, block.fee)?
                {
                    return Err(VmError::InsufficientBalance);
                }
                db.sub_balance(&block.token_id, block.amount)?;
            }
            Err(e) => return Err(e),
        }
        block.quota = quota::quota_used(
            use_quota,
            quota_total,
            quota_addition,
            quota_left,
            0,
            None,
        );
        block.seal();
        Ok(VmAccountBlock { block, state: db })
    }

    /// Reward sends may only originate from the built-ins that mint.
    fn send_reward(
        &self, db: VmDb, mut block: AccountBlock, use_quota: bool,
        quota_total: u64, quota_addition: u64,
    ) -> VmResult<VmAccountBlock> {
        let mut quota_left = quota_total;
        if use_quota {
            let cost = quota::intrinsic_gas_cost(&block.data, false)?;
            quota_left = quota::use_quota(quota_left, cost)?;
        }
        if block.account_address != *CONSENSUS_GROUP_CONTRACT_ADDRESS
            && block.account_address != *MINTAGE_CONTRACT_ADDRESS
        {
            return Err(VmError::InvalidSourceAddress);
        }
        block.quota = quota::quota_used(
            use_quota,
            quota_total,
            quota_addition,
            quota_left,
            0,
            None,
        );
        block.seal();
        Ok(VmAccountBlock { block, state: db })
    }

    fn send_refund(
        &self, mut db: VmDb, mut block: AccountBlock, use_quota: bool,
        quota_total: u64, quota_addition: u64,
    ) -> VmResult<VmAccountBlock> {
        block.fee = U256::zero();
        let mut quota_left = quota_total;
        if use_quota {
            let cost = quota::intrinsic_gas_cost(&block.data, false)?;
            quota_left = quota::use_quota(quota_left, cost)?;
        }
        if !can_transfer(&db, &block.token_id, block.amount, block.fee)? {
            return Err(VmError::InsufficientBalance);
        }
        db.sub_balance(&block.token_id, block.amount)?;
        block.quota = quota::quota_used(
            use_quota,
            quota_total,
            quota_addition,
            quota_left,
            0,
            None,
        );
        block.seal();
        Ok(VmAccountBlock { block, state: db })
    }

    /// Contract-create receive: credits the transferred amount, stores the
    /// contract code under the size cap, and charges intrinsic plus
    /// per-byte code cost from the fee-funded create quota. The create
    /// quota is fixed by the fee and cannot grow under a later snapshot,
    /// so any failure is terminal: state reverts and the transferred
    /// amount and fee are refunded.
    fn receive_create(
        &self, mut db: VmDb, mut block: AccountBlock,
        send_block: &AccountBlock, quota_total: u64,
    ) -> VmResult<ReceiveOutcome> {
        if db.prev_account_block().is_some() {
            return Err(VmError::AddressCollision);
        }
        let executed = (|| -> VmResult<()> {
            let cost = quota::intrinsic_gas_cost(&[], true)?;
            let quota_left = quota::use_quota(quota_total, cost)?;

            db.add_balance(&send_block.token_id, send_block.amount)?;

            let (contract_type, confirm_times, code) =
                parse_create_data(&send_block.data)?;
            if code.len() > self.config.max_code_size {
                return Err(VmError::CodeSizeLimit);
            }
            let code_cost = (code.len() as u64)
                .checked_mul(quota::CODE_GAS_PER_BYTE)
                .ok_or(VmError::OutOfQuota)?;
            quota::use_quota(quota_left, code_cost)?;
            db.set_contract_code(contract_type, code.to_vec());
            db.set_contract_meta(confirm_times);
            Ok(())
        })();
        match executed {
            Ok(()) => {
                block.data = db.get_receipt_hash().as_bytes().to_vec();
                self.finalize_receive(&db, &mut block, None, 0);
                block.seal();
                Ok(ReceiveOutcome::Committed(VmAccountBlock {
                    block,
                    state: db,
                }))
            }
            Err(error) => {
                warn!(
                    "contract create failed at {}: {}",
                    block.account_address, error
                );
                db.reset();
                let mut refunds = Vec::new();
                self.do_refund(
                    &mut db,
                    &mut refunds,
                    &block,
                    send_block,
                    Vec::new(),
                    BlockType::SendRefund,
                )?;
                block.data = receive_call_data(&db, RESULT_FAIL);
                self.finalize_receive(&db, &mut block, Some(&error), 0);
                let (db, sealed) =
                    self.execute_children(db, &block, refunds)?;
                Ok(ReceiveOutcome::FailedTerminal {
                    error,
                    block: merge_receive(db, block, sealed),
                })
            }
        }
    }

    /// Call receive: dispatches to built-ins or executes the plain/user
    /// path; on failure reverts state and emits refunds per the refund
    /// rule.
    fn receive_call(
        &self, mut db: VmDb, mut block: AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<ReceiveOutcome> {
        self.check_abort()?;

        if db.call_depth() >= self.config.call_depth_limit {
            db.add_balance(&send_block.token_id, send_block.amount)?;
            block.data = receive_call_data(&db, RESULT_DEPTH);
            self.finalize_receive(&db, &mut block, Some(&VmError::Depth), 0);
            block.seal();
            return Ok(ReceiveOutcome::FailedTerminal {
                error: VmError::Depth,
                block: VmAccountBlock { block, state: db },
            });
        }

        let method = self
            .registry
            .method_for(&block.account_address, &send_block.data)?;
        if let Some(method) = method {
            db.add_balance(&send_block.token_id, send_block.amount)?;
            let receive_result =
                method.do_receive(&mut db, &block, send_block, env);
            match receive_result {
                Ok(children) => {
                    block.data = receive_call_data(&db, RESULT_SUCCESS);
                    self.finalize_receive(&db, &mut block, None, 0);
                    let (db, sealed) =
                        self.execute_children(db, &block, children)?;
                    Ok(ReceiveOutcome::Committed(
                        merge_receive(db, block, sealed),
                    ))
                }
                Err(error) => {
                    warn!(
                        "builtin receive failed at {}: {}",
                        block.account_address, error
                    );
                    db.reset();
                    let mut refunds = Vec::new();
                    let (refund_data, should_refund) =
                        method.refund_data(send_block);
                    if should_refund {
                        self.do_refund(
                            &mut db,
                            &mut refunds,
                            &block,
                            send_block,
                            refund_data,
                            BlockType::SendCall,
                        )?;
                    }
                    block.data = receive_call_data(&db, RESULT_FAIL);
                    self.finalize_receive(&db, &mut block, Some(&error), 0);
                    let (db, sealed) =
                        self.execute_children(db, &block, refunds)?;
                    Ok(ReceiveOutcome::FailedTerminal {
                        error,
                        block: merge_receive(db, block, sealed),
                    })
                }
            }
        } else {
            self.receive_call_plain(db, block, send_block)
        }
    }

    /// Non-built-in receive. Plain accounts are a pure transfer; accounts
    /// with stored code are charged a code-proportional execution cost and
    /// follow the out-of-quota retry/refund rules.
    fn receive_call_plain(
        &self, mut db: VmDb, mut block: AccountBlock,
        send_block: &AccountBlock,
    ) -> VmResult<ReceiveOutcome> {
        let (quota_total, quota_addition) =
            quota::calc_quota(&self.config, &db, block.difficulty)?;
        let mut quota_left = quota_total;
        let cost = quota::intrinsic_gas_cost(&[], false)?;
        quota_left = match quota::use_quota(quota_left, cost) {
            Ok(left) => left,
            Err(_) => {
                return Ok(ReceiveOutcome::RetryLater(
                    RetryReason::IntrinsicQuotaShortage,
                ))
            }
        };
        db.add_balance(&send_block.token_id, send_block.amount)?;

        if !db.is_contract_account()? {
            block.data = receive_call_data(&db, RESULT_SUCCESS);
            let used = quota::quota_used(
                true,
                quota_total,
                quota_addition,
                quota_left,
                0,
                None,
            );
            self.finalize_receive(&db, &mut block, None, used);
            block.seal();
            return Ok(ReceiveOutcome::Committed(VmAccountBlock {
                block,
                state: db,
            }));
        }

        let code_len = db
            .get_contract_code(&block.account_address)?
            .map(|(_, code)| code.len())
            .unwrap_or(0);
        let exec_cost = code_len as u64 * quota::EXEC_GAS_PER_CODE_BYTE;
        match quota::use_quota(quota_left, exec_cost) {
            Ok(left) => {
                block.data = receive_call_data(&db, RESULT_SUCCESS);
                let used = quota::quota_used(
                    true,
                    quota_total,
                    quota_addition,
                    left,
                    0,
                    None,
                );
                self.finalize_receive(&db, &mut block, None, used);
                block.seal();
                Ok(ReceiveOutcome::Committed(VmAccountBlock {
                    block,
                    state: db,
                }))
            }
            Err(error) => {
                db.reset();
                if db.unconfirmed_count() > 0 {
                    // Not the earliest unconfirmed block for this account;
                    // a later snapshot may fund it.
                    return Ok(ReceiveOutcome::RetryLater(
                        RetryReason::OutOfQuotaNotFirst,
                    ));
                }
                // Forced no-op receive that refunds the send, preventing
                // livelock on the first unconfirmed block.
                let mut refunds = Vec::new();
                self.do_refund(
                    &mut db,
                    &mut refunds,
                    &block,
                    send_block,
                    Vec::new(),
                    BlockType::SendRefund,
                )?;
                block.data = receive_call_data(&db, RESULT_FAIL);
                let used = quota::quota_used(
                    true,
                    quota_total,
                    quota_addition,
                    0,
                    0,
                    Some(&error),
                );
                self.finalize_receive(&db, &mut block, Some(&error), used);
                let (db, sealed) =
                    self.execute_children(db, &block, refunds)?;
                Ok(ReceiveOutcome::FailedTerminal {
                    error,
                    block: merge_receive(db, block, sealed),
                })
            }
        }
    }

    fn receive_refund(
        &self, mut db: VmDb, mut block: AccountBlock,
        send_block: &AccountBlock,
    ) -> VmResult<ReceiveOutcome> {
        let (quota_total, quota_addition) =
            quota::calc_quota(&self.config, &db, block.difficulty)?;
        let cost = quota::intrinsic_gas_cost(&[], false)?;
        let quota_left = match quota::use_quota(quota_total, cost) {
            Ok(left) => left,
            Err(_) => {
                return Ok(ReceiveOutcome::RetryLater(
                    RetryReason::IntrinsicQuotaShortage,
                ))
            }
        };
        db.add_balance(&send_block.token_id, send_block.amount)?;
        block.data = receive_call_data(&db, RESULT_SUCCESS);
        let used = quota::quota_used(
            true,
            quota_total,
            quota_addition,
            quota_left,
            0,
            None,
        );
        self.finalize_receive(&db, &mut block, None, used);
        block.seal();
        Ok(ReceiveOutcome::Committed(VmAccountBlock { block, state: db }))
    }

    /// The refund rule: amount and fee merge into one native-token refund
    /// when the send moved native tokens with a fee; otherwise up to two
    /// refunds, one per positive component. Credits the refunded value back
    /// to the contract so the outgoing refund sends can cover it.
    fn do_refund(
        &self, db: &mut VmDb, refunds: &mut Vec<AccountBlock>,
        block: &AccountBlock, send_block: &AccountBlock,
        refund_data: Vec<u8>, refund_block_type: BlockType,
    ) -> VmResult<bool> {
        let mut refunded = false;
        if !send_block.amount.is_zero()
            && !send_block.fee.is_zero()
            && send_block.token_id == NATIVE_TOKEN_ID
        {
            let refund_amount = send_block.amount + send_block.fee;
            refunds.push(make_send_block(
                block.account_address,
                send_block.account_address,
                refund_block_type,
                refund_amount,
                NATIVE_TOKEN_ID,
                refund_data,
            ));
            db.add_balance(&NATIVE_TOKEN_ID, refund_amount)?;
            refunded = true;
        } else {
            if !send_block.amount.is_zero() {
                refunds.push(make_send_block(
                    block.account_address,
                    send_block.account_address,
                    refund_block_type,
                    send_block.amount,
                    send_block.token_id,
                    refund_data.clone(),
                ));
                db.add_balance(&send_block.token_id, send_block.amount)?;
                refunded = true;
            }
            if !send_block.fee.is_zero() {
                refunds.push(make_send_block(
                    block.account_address,
                    send_block.account_address,
                    refund_block_type,
                    send_block.fee,
                    NATIVE_TOKEN_ID,
                    refund_data,
                ));
                db.add_balance(&NATIVE_TOKEN_ID, send_block.fee)?;
                refunded = true;
            }
        }
        Ok(refunded)
    }

    /// Runs the emitted child sends through the send paths without quota,
    /// assigning their chain positions under the parent receive.
    fn execute_children(
        &self, mut db: VmDb, parent: &AccountBlock,
        templates: Vec<AccountBlock>,
    ) -> VmResult<(VmDb, Vec<AccountBlock>)> {
        let mut sealed = Vec::with_capacity(templates.len());
        for (index, mut child) in templates.into_iter().enumerate() {
            self.check_abort()?;
            child.account_address = parent.account_address;
            child.height = parent.height + index as u64 + 1;
            child.prev_hash = Hash::zero();
            let executed = match child.block_type {
                BlockType::SendCall => self.send_call(db, child, false, 0, 0)?,
                BlockType::SendReward => {
                    self.send_reward(db, child, false, 0, 0)?
                }
                BlockType::SendRefund => {
                    self.send_refund(db, child, false, 0, 0)?
                }
                _ => return Err(VmError::InvalidBlockType),
            };
            let VmAccountBlock { mut block, state } = executed;
            block.quota = 0;
            block.seal();
            sealed.push(block);
            db = state;
        }
        Ok((db, sealed))
    }

    fn finalize_receive(
        &self, db: &VmDb, block: &mut AccountBlock, error: Option<&VmError>,
        quota_used: u64,
    ) {
        block.quota = quota_used;
        block.state_hash = db.get_receipt_hash();
        block.log_hash = db.get_log_list_hash();
        block.block_type = if error.is_some() {
            BlockType::ReceiveError
        } else {
            BlockType::Receive
        };
    }
}

fn merge_receive(
    db: VmDb, mut block: AccountBlock, children: Vec<AccountBlock>,
) -> VmAccountBlock {
    block.send_block_list = children;
    block.seal();
    VmAccountBlock { block, state: db }
}

pub fn receive_call_data(db: &VmDb, result: u8) -> Vec<u8> {
    let mut data = db.get_receipt_hash().as_bytes().to_vec();
    data.push(result);
    data
}

pub fn can_transfer(
    db: &VmDb, token: &TokenId, amount: U256, fee: U256,
) -> VmResult<bool> {
    if fee.is_zero() {
        return Ok(amount <= db.get_balance(token)?);
    }
    if *token == NATIVE_TOKEN_ID {
        return Ok(amount + fee <= db.get_balance(token)?);
    }
    Ok(amount <= db.get_balance(token)?
        && fee <= db.get_balance(&NATIVE_TOKEN_ID)?)
}

/// Builds an unpositioned send block; the executor assigns address, height
/// and hash when it runs the child list.
pub fn make_send_block(
    from: Address, to: Address, block_type: BlockType, amount: U256,
    token_id: TokenId, data: Vec<u8>,
) -> AccountBlock {
    AccountBlock {
        block_type,
        account_address: from,
        to_address: to,
        amount,
        token_id,
        fee: U256::zero(),
        data,
        ..Default::default()
    }
}

/// Create payload layout: contract type, confirm times, then the code.
pub fn parse_create_data(data: &[u8]) -> VmResult<(u8, u8, &[u8])> {
    if data.len() < 2 {
        return Err(VmError::InvalidMethodParam(
            "create data too short".into(),
        ));
    }
    Ok((data[0], data[1], &data[2..]))
}

pub fn make_create_data(
    contract_type: u8, confirm_times: u8, code: &[u8],
) -> Vec<u8> {
    let mut data = vec![contract_type, confirm_times];
    data.extend_from_slice(code);
    data
}

/// Derives a contract address from the creating transaction's position.
pub fn new_contract_address(
    from: &Address, height: u64, prev_hash: &Hash, snapshot_hash: &Hash,
) -> Address {
    let mut s = RlpStream::new_list(4);
    s.append(from)
        .append(&height)
        .append(prev_hash)
        .append(snapshot_hash);
    let digest = keccak(s.out());
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest.as_bytes()[..20]);
    Address::from_id(id, ADDRESS_TAG_CONTRACT)
}

// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! The built-in contract family (C7): a closed set of contract addresses
//! whose methods are implemented natively and dispatched by the 4-byte
//! selector prefix of the call data.

pub mod consensus_group;
pub mod dex;
pub mod mintage;
pub mod pledge;

use crate::{
    abi,
    env::VmEnv,
    error::{VmError, VmResult},
};
use lattice_statedb::VmDb;
use lattice_types::{Address, U256, ADDRESS_TAG_CONTRACT};
use primitives::AccountBlock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

fn builtin_address(tag: u8) -> Address {
    let mut id = [0u8; 20];
    id[19] = tag;
    Address::from_id(id, ADDRESS_TAG_CONTRACT)
}

lazy_static! {
    pub static ref PLEDGE_CONTRACT_ADDRESS: Address = builtin_address(1);
    pub static ref CONSENSUS_GROUP_CONTRACT_ADDRESS: Address =
        builtin_address(2);
    pub static ref MINTAGE_CONTRACT_ADDRESS: Address = builtin_address(3);
    pub static ref DEX_FUND_CONTRACT_ADDRESS: Address = builtin_address(4);
    pub static ref DEX_TRADE_CONTRACT_ADDRESS: Address = builtin_address(5);
}

/// One native method of a built-in contract. `do_send` validates (and may
/// normalize) the send; it must not mutate durable state. `do_receive` is
/// the state transition and may emit an ordered list of child sends that
/// the VM dispatches under the same receive.
pub trait BuiltinContractMethod: Send + Sync {
    fn fee(&self, _block: &AccountBlock) -> VmResult<U256> {
        Ok(U256::zero())
    }

    fn send_quota(&self, data: &[u8]) -> VmResult<u64>;

    fn receive_quota(&self) -> u64;

    fn do_send(&self, db: &mut VmDb, block: &mut AccountBlock)
        -> VmResult<()>;

    fn do_receive(
        &self, db: &mut VmDb, block: &AccountBlock,
        send_block: &AccountBlock, env: &VmEnv,
    ) -> VmResult<Vec<AccountBlock>>;

    /// Data for the refund send emitted when `do_receive` fails, and
    /// whether a refund should be emitted at all.
    fn refund_data(&self, _send_block: &AccountBlock) -> (Vec<u8>, bool) {
        (Vec::new(), false)
    }
}

type MethodTable = HashMap<[u8; 4], Arc<dyn BuiltinContractMethod>>;

/// Dispatch table over the fixed built-in addresses, built once at startup
/// and threaded through VM construction.
pub struct ContractRegistry {
    contracts: BTreeMap<Address, MethodTable>,
}

impl ContractRegistry {
    /// The standard contract family: Pledge, ConsensusGroup, Mintage,
    /// DexFund and DexTrade.
    pub fn standard() -> Self {
        let mut contracts = BTreeMap::new();
        contracts.insert(*PLEDGE_CONTRACT_ADDRESS, pledge::method_table());
        contracts.insert(
            *CONSENSUS_GROUP_CONTRACT_ADDRESS,
            consensus_group::method_table(),
        );
        contracts.insert(*MINTAGE_CONTRACT_ADDRESS, mintage::method_table());
        contracts
            .insert(*DEX_FUND_CONTRACT_ADDRESS, dex::fund::method_table());
        contracts
            .insert(*DEX_TRADE_CONTRACT_ADDRESS, dex::trade::method_table());
        ContractRegistry { contracts }
    }

    pub fn is_builtin(&self, addr: &Address) -> bool {
        self.contracts.contains_key(addr)
    }

    /// Resolves a call against a built-in address. `Ok(None)` means the
    /// address is not a built-in; an unknown selector on a built-in is an
    /// error.
    pub fn method_for(
        &self, addr: &Address, data: &[u8],
    ) -> VmResult<Option<Arc<dyn BuiltinContractMethod>>> {
        let table = match self.contracts.get(addr) {
            None => return Ok(None),
            Some(table) => table,
        };
        let selector =
            abi::selector_of(data).ok_or(VmError::MethodNotFound)?;
        match table.get(&selector) {
            Some(method) => Ok(Some(method.clone())),
            None => Err(VmError::MethodNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_addresses_are_contract_tagged_and_distinct() {
        let addrs = [
            *PLEDGE_CONTRACT_ADDRESS,
            *CONSENSUS_GROUP_CONTRACT_ADDRESS,
            *MINTAGE_CONTRACT_ADDRESS,
            *DEX_FUND_CONTRACT_ADDRESS,
            *DEX_TRADE_CONTRACT_ADDRESS,
        ];
        for addr in &addrs {
            assert!(addr.is_contract());
        }
        let unique: std::collections::HashSet<_> = addrs.iter().collect();
        assert_eq!(unique.len(), addrs.len());
    }

    #[test]
    fn registry_rejects_unknown_selectors() {
        let registry = ContractRegistry::standard();
        assert!(registry.is_builtin(&DEX_FUND_CONTRACT_ADDRESS));
        assert_eq!(
            registry
                .method_for(&DEX_FUND_CONTRACT_ADDRESS, &[0xde, 0xad, 0xbe, 0xef])
                .err(),
            Some(VmError::MethodNotFound)
        );
        let user = builtin_address(0x77);
        assert!(registry.method_for(&user, &[0; 4]).unwrap().is_none());
    }
}

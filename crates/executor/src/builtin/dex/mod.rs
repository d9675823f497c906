// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! The exchange built-ins: DexFund custodies user funds, locks them for
//! orders and settles trades and fees; DexTrade keeps the order book and
//! reports settlements back to DexFund.

pub mod fund;
pub mod state;
pub mod trade;

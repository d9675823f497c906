// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use lattice_types::{Address, U256};

/// Oracle onto the producer-election subsystem. The executor only ever asks
/// for period boundaries and historical vote weights; election itself is an
/// external collaborator.
pub trait ConsensusReader: Send + Sync {
    /// Period index a timestamp falls into.
    fn time_to_index(&self, timestamp: u64) -> u64;

    /// Seconds per period.
    fn period_time(&self) -> u64;

    /// Aggregated vote weight per node address for a registration name over
    /// `[start_index, end_index)`.
    fn vote_details(
        &self, start_index: u64, end_index: u64, name: &str,
    ) -> Vec<(Address, U256)>;
}

/// Fixed-width periods anchored at a genesis timestamp. The production
/// deployment wires the real election reader here; tests use this directly.
pub struct FixedPeriodReader {
    genesis_timestamp: u64,
    period_seconds: u64,
}

impl FixedPeriodReader {
    pub fn new(genesis_timestamp: u64, period_seconds: u64) -> Self {
        FixedPeriodReader { genesis_timestamp, period_seconds }
    }
}

impl ConsensusReader for FixedPeriodReader {
    fn time_to_index(&self, timestamp: u64) -> u64 {
        timestamp.saturating_sub(self.genesis_timestamp) / self.period_seconds
    }

    fn period_time(&self) -> u64 { self.period_seconds }

    fn vote_details(
        &self, _start_index: u64, _end_index: u64, _name: &str,
    ) -> Vec<(Address, U256)> {
        Vec::new()
    }
}

/// Execution environment handed to built-in contract receives.
pub struct VmEnv<'a> {
    pub consensus: &'a dyn ConsensusReader,
}

impl<'a> VmEnv<'a> {
    pub fn new(consensus: &'a dyn ConsensusReader) -> Self {
        VmEnv { consensus }
    }

    pub fn current_period(&self, snapshot_timestamp: u64) -> u64 {
        self.consensus.time_to_index(snapshot_timestamp)
    }
}

//! Node-local consensus policy: the chain policy plus timer settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tessera_common::env::{ConsensusPolicy, NetworkId, ThresholdRatio};
use tessera_common::error::{Result, TesseraError};

/// Timer settings, in milliseconds when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerPolicy {
    pub timeout_waiting_proposal: u64,
    pub interval_broadcasting_init_ballot: u64,
    pub interval_broadcasting_proposal: u64,
    pub wait_broadcasting_accept_ballot: u64,
    pub interval_broadcasting_accept_ballot: u64,
    pub timespan_valid_ballot: u64,
    pub timeout_process_proposal: u64,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            timeout_waiting_proposal: 5_000,
            interval_broadcasting_init_ballot: 1_000,
            interval_broadcasting_proposal: 1_000,
            wait_broadcasting_accept_ballot: 2_000,
            interval_broadcasting_accept_ballot: 1_000,
            timespan_valid_ballot: 60_000,
            timeout_process_proposal: 30_000,
        }
    }
}

impl TimerPolicy {
    pub fn is_valid(&self) -> Result<()> {
        let timers = [
            ("timeout_waiting_proposal", self.timeout_waiting_proposal),
            ("interval_broadcasting_init_ballot", self.interval_broadcasting_init_ballot),
            ("interval_broadcasting_proposal", self.interval_broadcasting_proposal),
            ("wait_broadcasting_accept_ballot", self.wait_broadcasting_accept_ballot),
            ("interval_broadcasting_accept_ballot", self.interval_broadcasting_accept_ballot),
            ("timespan_valid_ballot", self.timespan_valid_ballot),
            ("timeout_process_proposal", self.timeout_process_proposal),
        ];
        for (name, ms) in timers {
            if ms == 0 {
                return Err(TesseraError::Config(format!("policy.{name} must be > 0")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalPolicy {
    pub network_id: NetworkId,
    pub consensus: ConsensusPolicy,
    pub timers: TimerPolicy,
}

impl LocalPolicy {
    pub fn new(network_id: NetworkId, consensus: ConsensusPolicy, timers: TimerPolicy) -> Result<Self> {
        let p = Self { network_id, consensus, timers };
        p.is_valid()?;
        Ok(p)
    }

    pub fn is_valid(&self) -> Result<()> {
        if self.network_id.is_empty() {
            return Err(TesseraError::Config("empty network id".into()));
        }
        self.consensus
            .is_valid()
            .map_err(|e| TesseraError::Config(format!("invalid consensus policy: {e}")))?;
        self.timers.is_valid()
    }

    pub fn threshold(&self) -> ThresholdRatio {
        self.consensus.threshold
    }

    pub fn number_of_acting(&self) -> usize {
        self.consensus.number_of_acting_suffrage_nodes as usize
    }

    pub fn max_operations_in_seal(&self) -> usize {
        self.consensus.max_operations_in_seal as usize
    }

    pub fn max_operations_in_proposal(&self) -> usize {
        self.consensus.max_operations_in_proposal as usize
    }

    pub fn timeout_waiting_proposal(&self) -> Duration {
        Duration::from_millis(self.timers.timeout_waiting_proposal)
    }

    pub fn interval_broadcasting_init(&self) -> Duration {
        Duration::from_millis(self.timers.interval_broadcasting_init_ballot)
    }

    pub fn interval_broadcasting_proposal(&self) -> Duration {
        Duration::from_millis(self.timers.interval_broadcasting_proposal)
    }

    pub fn wait_broadcasting_accept(&self) -> Duration {
        Duration::from_millis(self.timers.wait_broadcasting_accept_ballot)
    }

    pub fn interval_broadcasting_accept(&self) -> Duration {
        Duration::from_millis(self.timers.interval_broadcasting_accept_ballot)
    }

    pub fn timespan_valid_ballot(&self) -> Duration {
        Duration::from_millis(self.timers.timespan_valid_ballot)
    }

    pub fn timeout_process_proposal(&self) -> Duration {
        Duration::from_millis(self.timers.timeout_process_proposal)
    }
}

//! Consensus timing and sizing configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tbft_types::BLOCK_PART_SIZE_BYTES;

/// Configuration for the round state machine.
///
/// Timeouts grow linearly with the round: `base + delta * round`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Base propose timeout.
    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,

    /// Base wait after +2/3 of any prevotes.
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,

    /// Base wait after +2/3 of any precommits.
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,

    /// Pause between committing a block and starting the next height.
    pub timeout_commit_ms: u64,

    /// Start the next height as soon as the block is committed.
    pub skip_timeout_commit: bool,

    /// Size of each block part in bytes.
    pub block_part_size: usize,

    /// Smallest committee the node registry accepts.
    pub min_committee_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: false,
            block_part_size: BLOCK_PART_SIZE_BYTES,
            min_committee_size: 4,
        }
    }
}

fn linear(base_ms: u64, delta_ms: u64, round: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_add(delta_ms.saturating_mul(round as u64)))
}

impl ConsensusConfig {
    pub fn propose_timeout(&self, round: u32) -> Duration {
        linear(self.timeout_propose_ms, self.timeout_propose_delta_ms, round)
    }

    pub fn prevote_timeout(&self, round: u32) -> Duration {
        linear(self.timeout_prevote_ms, self.timeout_prevote_delta_ms, round)
    }

    pub fn precommit_timeout(&self, round: u32) -> Duration {
        linear(
            self.timeout_precommit_ms,
            self.timeout_precommit_delta_ms,
            round,
        )
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_commit_ms)
    }
}

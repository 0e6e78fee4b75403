//! Committee BFT consensus state machine.
//!
//! This crate provides a synchronous Tendermint-style consensus
//! implementation that can be used for both simulation and production.
//!
//! # Architecture
//!
//! [`ConsensusState`] processes events synchronously and returns actions:
//!
//! - `Event::TimeoutFired` → advance the round step
//! - `Event::ProposalReceived` / `Event::BlockPartReceived` → assemble the
//!   proposed block
//! - `Event::VoteReceived` → tally prevotes and precommits, lock, commit
//!
//! All I/O is performed by the runner via returned `Action`s. Calls into the
//! chain (fetch, verify, commit) go through [`StateAgent`], which wraps the
//! external [`ChainAgent`].
//!
//! # Terminology
//!
//! - **Height**: Position in the chain. A committee decides heights within
//!   its window `[begin, end]`.
//!
//! - **Round**: Attempt number at one height. Each round has its own
//!   proposer, chosen by weighted round robin over the validator set.
//!
//! - **maj23**: More than two thirds of the voting power for the same block
//!   id (possibly nil).
//!
//! - **POL (proof of lock)**: A round whose prevotes reached maj23 for a
//!   block. A validator locked on a block only unlocks on a newer POL.
//!
//! # Safety
//!
//! - [`PrivValidator`] never signs two different messages for the same
//!   height, round and step, across restarts.
//! - [`VoteSet`] rejects a second, different vote from the same validator.
//! - A block is committed only after +2/3 precommits for it in one round.

mod config;
mod height_vote_set;
mod priv_validator;
mod state;
mod state_agent;
mod vote_set;

pub use config::ConsensusConfig;
pub use height_vote_set::{HeightVoteSet, HeightVoteSetError};
pub use priv_validator::{
    check_hrs, FileSignStateStore, MemorySignStateStore, PrivValidator, SignError, SignState,
    SignStateStore, SignStateStoreError, SignStep,
};
pub use state::{ConsensusState, ConsensusStats, RoundStateSnapshot};
pub use state_agent::{
    AgentCall, AgentObserver, ChainAgent, ChainAgentError, NoopObserver, StateAgent,
    StateAgentError,
};
pub use vote_set::{VoteSet, VoteSetError};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use crate::{ChainAgent, ChainAgentError};
    use parking_lot::Mutex;
    use tbft_types::{Address, Block, BlockSign, CommitteeMember, Hash, SignResult};

    #[derive(Debug, Default)]
    struct MockChain {
        height: u64,
        committed: Vec<Block>,
        fetches: u32,
        fetch_error: Option<String>,
        verify_error: Option<String>,
        verify_result: Option<SignResult>,
        commit_error: Option<String>,
        seeds: Vec<CommitteeMember>,
    }

    /// In-memory chain agent.
    ///
    /// Produces deterministic blocks on top of its current height and records
    /// every committed block.
    #[derive(Debug, Default)]
    pub struct MockChainAgent {
        inner: Mutex<MockChain>,
    }

    impl MockChainAgent {
        pub fn new(height: u64) -> Self {
            Self {
                inner: Mutex::new(MockChain {
                    height,
                    ..MockChain::default()
                }),
            }
        }

        pub fn committed(&self) -> Vec<Block> {
            self.inner.lock().committed.clone()
        }

        pub fn fetch_count(&self) -> u32 {
            self.inner.lock().fetches
        }

        pub fn set_height(&self, height: u64) {
            self.inner.lock().height = height;
        }

        pub fn set_fetch_error(&self, error: Option<String>) {
            self.inner.lock().fetch_error = error;
        }

        pub fn set_verify_error(&self, error: Option<String>) {
            self.inner.lock().verify_error = error;
        }

        pub fn set_verify_result(&self, result: SignResult) {
            self.inner.lock().verify_result = Some(result);
        }

        pub fn set_commit_error(&self, error: Option<String>) {
            self.inner.lock().commit_error = error;
        }

        pub fn set_seed_members(&self, seeds: Vec<CommitteeMember>) {
            self.inner.lock().seeds = seeds;
        }
    }

    impl ChainAgent for MockChainAgent {
        fn fetch_fast_block(
            &self,
            committee_id: u64,
            _members: &[CommitteeMember],
        ) -> Result<Block, ChainAgentError> {
            let mut chain = self.inner.lock();
            chain.fetches += 1;
            if let Some(e) = &chain.fetch_error {
                return Err(ChainAgentError::FetchFailed(e.clone()));
            }
            let height = chain.height + 1;
            let parent = chain
                .committed
                .last()
                .map(Block::hash)
                .unwrap_or(Hash::ZERO);
            let mut payload = committee_id.to_le_bytes().to_vec();
            payload.extend_from_slice(&height.to_le_bytes());
            Ok(Block::new(
                height,
                parent,
                Address::default(),
                height * 1000,
                payload,
            ))
        }

        fn verify_fast_block(
            &self,
            block: &Block,
            _result: bool,
        ) -> Result<BlockSign, ChainAgentError> {
            let chain = self.inner.lock();
            if let Some(e) = &chain.verify_error {
                return Err(ChainAgentError::VerifyFailed(e.clone()));
            }
            let hash = block.hash();
            Ok(BlockSign {
                height: block.height,
                hash,
                result: chain.verify_result.unwrap_or(SignResult::Agree),
                signature: hash.as_bytes().to_vec(),
            })
        }

        fn broadcast_consensus(&self, block: &Block) -> Result<(), ChainAgentError> {
            let mut chain = self.inner.lock();
            if let Some(e) = &chain.commit_error {
                return Err(ChainAgentError::BroadcastFailed(e.clone()));
            }
            chain.height = chain.height.max(block.height);
            chain.committed.push(block.clone());
            Ok(())
        }

        fn current_height(&self) -> u64 {
            self.inner.lock().height
        }

        fn fast_last_proposer(&self) -> Address {
            self.inner
                .lock()
                .committed
                .last()
                .map(|b| b.proposer)
                .unwrap_or_default()
        }

        fn seed_members(&self) -> Vec<CommitteeMember> {
            self.inner.lock().seeds.clone()
        }
    }
}

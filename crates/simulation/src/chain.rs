//! In-memory chain agent, one per simulated validator.

use parking_lot::Mutex;
use tbft_bft::{ChainAgent, ChainAgentError};
use tbft_types::{
    Address, Block, BlockSign, CommitteeMember, Hash, KeyPair, SignResult,
};
use tracing::debug;

#[derive(Debug, Default)]
struct ChainState {
    committed: Vec<Block>,
    fetches: u64,
    rejected: u64,
    against: bool,
}

/// A validator's local chain.
///
/// Blocks it proposes carry the owner's address and a payload unique to the
/// owner, so conflicting commits across validators are detectable.
#[derive(Debug)]
pub struct SimChain {
    key: KeyPair,
    payload_size: usize,
    state: Mutex<ChainState>,
}

impl SimChain {
    pub fn new(key: KeyPair, payload_size: usize) -> Self {
        Self {
            key,
            payload_size,
            state: Mutex::new(ChainState::default()),
        }
    }

    pub fn height(&self) -> u64 {
        self.state.lock().committed.len() as u64
    }

    pub fn committed(&self) -> Vec<Block> {
        self.state.lock().committed.clone()
    }

    pub fn committed_hashes(&self) -> Vec<Hash> {
        self.state.lock().committed.iter().map(Block::hash).collect()
    }

    pub fn fetch_count(&self) -> u64 {
        self.state.lock().fetches
    }

    /// Commits refused because they did not extend the chain.
    pub fn rejected_commits(&self) -> u64 {
        self.state.lock().rejected
    }

    /// Make this validator vote against every block it verifies.
    pub fn set_against(&self, against: bool) {
        self.state.lock().against = against;
    }
}

impl ChainAgent for SimChain {
    fn fetch_fast_block(
        &self,
        committee_id: u64,
        _members: &[CommitteeMember],
    ) -> Result<Block, ChainAgentError> {
        let mut state = self.state.lock();
        state.fetches += 1;
        let height = state.committed.len() as u64 + 1;
        let parent = state.committed.last().map(Block::hash).unwrap_or(Hash::ZERO);

        let mut payload = Vec::with_capacity(self.payload_size + 16);
        payload.extend_from_slice(&committee_id.to_le_bytes());
        payload.extend_from_slice(&state.fetches.to_le_bytes());
        payload.extend_from_slice(self.key.address().as_bytes());
        payload.resize(self.payload_size.max(payload.len()), height as u8);

        Ok(Block::new(
            height,
            parent,
            self.key.address(),
            height * 1000,
            payload,
        ))
    }

    fn verify_fast_block(&self, block: &Block, _result: bool) -> Result<BlockSign, ChainAgentError> {
        let state = self.state.lock();
        let expected = state.committed.len() as u64 + 1;
        if block.height != expected {
            return Err(ChainAgentError::VerifyFailed(format!(
                "block height {} does not extend chain at {}",
                block.height, expected - 1
            )));
        }
        let hash = block.hash();
        let result = if state.against {
            SignResult::Against
        } else {
            SignResult::Agree
        };
        Ok(BlockSign {
            height: block.height,
            hash,
            result,
            signature: self.key.sign(hash.as_bytes()).as_bytes().to_vec(),
        })
    }

    fn broadcast_consensus(&self, block: &Block) -> Result<(), ChainAgentError> {
        let mut state = self.state.lock();
        let expected = state.committed.len() as u64 + 1;
        let parent = state.committed.last().map(Block::hash).unwrap_or(Hash::ZERO);
        if block.height != expected || block.parent_hash != parent {
            state.rejected += 1;
            return Err(ChainAgentError::BroadcastFailed(format!(
                "block {} does not extend chain at {}",
                block.height,
                expected - 1
            )));
        }
        debug!(
            owner = %self.key.address(),
            height = block.height,
            hash = %block.hash(),
            "Chain applied block"
        );
        state.committed.push(block.clone());
        Ok(())
    }

    fn current_height(&self) -> u64 {
        self.height()
    }

    fn fast_last_proposer(&self) -> Address {
        self.state
            .lock()
            .committed
            .last()
            .map(|b| b.proposer)
            .unwrap_or_default()
    }

    fn seed_members(&self) -> Vec<CommitteeMember> {
        Vec::new()
    }
}

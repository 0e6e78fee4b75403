//! Bridge between consensus and the external chain agent.

use crate::priv_validator::{PrivValidator, SignError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tbft_types::{
    make_part_set, Address, Block, BlockCodecError, BlockSign, CommitteeMember, KeepBlockSign,
    PartSet, PeerId, Proposal, PublicKey, ValidatorSet, Vote,
};
use tracing::{debug, info, warn};

/// Errors reported by the chain agent. Consensus forwards them untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainAgentError {
    #[error("fetch block failed: {0}")]
    FetchFailed(String),

    #[error("verify block failed: {0}")]
    VerifyFailed(String),

    #[error("broadcast consensus failed: {0}")]
    BroadcastFailed(String),
}

/// The chain that produces, verifies and finally applies blocks.
pub trait ChainAgent: Send + Sync {
    /// Build a candidate block for the next height.
    fn fetch_fast_block(
        &self,
        committee_id: u64,
        members: &[CommitteeMember],
    ) -> Result<Block, ChainAgentError>;

    /// Verify a proposed block and sign the verdict.
    fn verify_fast_block(&self, block: &Block, result: bool) -> Result<BlockSign, ChainAgentError>;

    /// Hand over a finalized block.
    fn broadcast_consensus(&self, block: &Block) -> Result<(), ChainAgentError>;

    fn current_height(&self) -> u64;

    fn fast_last_proposer(&self) -> Address;

    /// Fixed members every committee must carry.
    fn seed_members(&self) -> Vec<CommitteeMember>;
}

/// Chain agent calls whose latency is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentCall {
    FetchBlock,
    VerifyBlock,
    BroadcastConsensus,
}

impl AgentCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCall::FetchBlock => "fetch_block",
            AgentCall::VerifyBlock => "verify_block",
            AgentCall::BroadcastConsensus => "broadcast_consensus",
        }
    }
}

/// Receives latency samples for chain agent calls.
pub trait AgentObserver: Send + Sync {
    fn observe(&self, call: AgentCall, elapsed: Duration, ok: bool);
}

/// Observer that drops every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AgentObserver for NoopObserver {
    fn observe(&self, _call: AgentCall, _elapsed: Duration, _ok: bool) {}
}

#[derive(Debug, thiserror::Error)]
pub enum StateAgentError {
    #[error("height {height} outside committee window [{begin}, {end}]")]
    OutOfRange { height: u64, begin: u64, end: u64 },

    #[error("peer {0} is not a committee validator")]
    NotValidator(PeerId),

    #[error(transparent)]
    Agent(#[from] ChainAgentError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Codec(#[from] BlockCodecError),
}

#[derive(Debug, Clone, Copy)]
struct HeightWindow {
    begin: u64,
    /// Zero while the committee's last height is unknown.
    end: u64,
}

impl HeightWindow {
    fn check(&self, height: u64) -> Result<(), StateAgentError> {
        let over = self.end > 0 && height > self.end;
        if over || self.begin > height {
            return Err(StateAgentError::OutOfRange {
                height,
                begin: self.begin,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Per-committee view of the chain: the height window, the validator set
/// and the local signer.
pub struct StateAgent {
    chain_id: String,
    committee_id: u64,
    agent: Arc<dyn ChainAgent>,
    observer: Arc<dyn AgentObserver>,
    priv_validator: Arc<PrivValidator>,

    window: Mutex<HeightWindow>,
    validators: RwLock<ValidatorSet>,
    ids: RwLock<HashSet<PeerId>>,
    /// Bumped whenever the validator set is replaced.
    generation: AtomicU64,
    last_height: AtomicU64,
}

impl fmt::Debug for StateAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let window = *self.window.lock();
        f.debug_struct("StateAgent")
            .field("chain_id", &self.chain_id)
            .field("committee_id", &self.committee_id)
            .field("begin", &window.begin)
            .field("end", &window.end)
            .field("validators", &self.validators.read().len())
            .finish()
    }
}

impl StateAgent {
    pub fn new(
        agent: Arc<dyn ChainAgent>,
        chain_id: impl Into<String>,
        committee_id: u64,
        validators: ValidatorSet,
        begin_height: u64,
        priv_validator: Arc<PrivValidator>,
    ) -> Self {
        let last_height = agent.current_height();
        let ids = validators.make_ids();
        debug!(
            committee_id,
            begin = begin_height,
            current = last_height,
            "Created state agent"
        );
        Self {
            chain_id: chain_id.into(),
            committee_id,
            agent,
            observer: Arc::new(NoopObserver),
            priv_validator,
            window: Mutex::new(HeightWindow {
                begin: begin_height,
                end: 0,
            }),
            validators: RwLock::new(validators),
            ids: RwLock::new(ids),
            generation: AtomicU64::new(0),
            last_height: AtomicU64::new(last_height),
        }
    }

    /// Report chain agent latency to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn committee_id(&self) -> u64 {
        self.committee_id
    }

    fn timed<T, E>(&self, call: AgentCall, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let started = Instant::now();
        let result = f();
        self.observer.observe(call, started.elapsed(), result.is_ok());
        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chain agent calls
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch a candidate block for the next height.
    pub fn make_block(&self, members: &[CommitteeMember]) -> Result<Block, StateAgentError> {
        let block = self.timed(AgentCall::FetchBlock, || {
            self.agent.fetch_fast_block(self.committee_id, members)
        })?;
        self.window.lock().check(block.height)?;
        Ok(block)
    }

    /// Ask the chain agent to verify `block`.
    pub fn validate_block(
        &self,
        block: &Block,
        result: bool,
    ) -> Result<KeepBlockSign, StateAgentError> {
        self.window.lock().check(block.height)?;
        let sign = self.timed(AgentCall::VerifyBlock, || {
            self.agent.verify_fast_block(block, result)
        })?;
        debug!(
            height = sign.height,
            result = ?sign.result,
            "Chain agent verified block"
        );
        Ok(sign.into())
    }

    /// Hand a finalized block to the chain agent. Failures are not retried.
    pub fn consensus_commit(&self, block: &Block) -> Result<(), StateAgentError> {
        self.timed(AgentCall::BroadcastConsensus, || {
            self.agent.broadcast_consensus(block)
        })?;
        self.last_height.fetch_max(block.height, Ordering::AcqRel);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Height window
    // ═══════════════════════════════════════════════════════════════════════

    /// Move the first height. Ignored unless an end is set and `height` lies
    /// below it.
    pub fn set_begin_height(&self, height: u64) {
        let mut window = self.window.lock();
        if window.end > 0 && height < window.end {
            window.begin = height;
            debug!(
                committee_id = self.committee_id,
                begin = window.begin,
                end = window.end,
                "Set committee window"
            );
        }
    }

    /// Set the last height this committee decides. Zero means unbounded.
    pub fn set_end_height(&self, height: u64) {
        let mut window = self.window.lock();
        window.end = height;
        info!(
            committee_id = self.committee_id,
            begin = window.begin,
            end = window.end,
            current = self.agent.current_height(),
            "Set committee window"
        );
    }

    pub fn begin_height(&self) -> u64 {
        self.window.lock().begin
    }

    pub fn end_height(&self) -> u64 {
        self.window.lock().end
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Validators
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the committee's validator set. With `make_ids` the peer
    /// allow-list is rebuilt too.
    pub fn update_validator(&self, validators: ValidatorSet, make_ids: bool) {
        if make_ids {
            *self.ids.write() = validators.make_ids();
        }
        *self.validators.write() = validators;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn validators(&self) -> ValidatorSet {
        self.validators.read().clone()
    }

    /// Changes every time [`update_validator`](Self::update_validator) runs.
    pub fn validators_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `peer` belongs to the committee.
    pub fn has_peer_id(&self, peer: &PeerId) -> Result<(), StateAgentError> {
        if self.ids.read().contains(peer) {
            Ok(())
        } else {
            Err(StateAgentError::NotValidator(peer.clone()))
        }
    }

    /// Current chain height, refreshed from the chain agent.
    pub fn get_last_block_height(&self) -> u64 {
        let height = self.agent.current_height();
        self.last_height.store(height, Ordering::Release);
        height
    }

    pub fn get_last_validator_address(&self) -> Address {
        self.agent.fast_last_proposer()
    }

    pub fn seed_members(&self) -> Vec<CommitteeMember> {
        self.agent.seed_members()
    }

    pub fn make_part_set(&self, part_size: usize, block: &Block) -> Result<PartSet, StateAgentError> {
        Ok(make_part_set(part_size, block)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local signer
    // ═══════════════════════════════════════════════════════════════════════

    pub fn address(&self) -> Address {
        self.priv_validator.address()
    }

    pub fn public_key(&self) -> PublicKey {
        self.priv_validator.public_key()
    }

    pub fn sign_vote(&self, vote: &mut Vote) -> Result<(), StateAgentError> {
        Ok(self.priv_validator.sign_vote(&self.chain_id, vote)?)
    }

    pub fn sign_proposal(&self, proposal: &mut Proposal) -> Result<(), StateAgentError> {
        Ok(self.priv_validator.sign_proposal(&self.chain_id, proposal)?)
    }

    /// Clear the signer's history, e.g. when this node joins a new committee.
    pub fn priv_reset(&self) {
        if let Err(e) = self.priv_validator.reset() {
            warn!(error = %e, "Failed to persist sign state reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChainAgent;
    use tbft_types::test_utils::{test_key, test_keys, test_validator_set};
    use tbft_types::{BlockId, Hash, SignResult, VoteType};

    #[derive(Default)]
    struct RecordingObserver {
        samples: Mutex<Vec<(AgentCall, bool)>>,
    }

    impl AgentObserver for RecordingObserver {
        fn observe(&self, call: AgentCall, _elapsed: Duration, ok: bool) {
            self.samples.lock().push((call, ok));
        }
    }

    fn agent_at(height: u64, begin: u64) -> (Arc<MockChainAgent>, StateAgent) {
        let chain = Arc::new(MockChainAgent::new(height));
        let keys = test_keys(4);
        let agent = StateAgent::new(
            chain.clone(),
            "test-chain",
            1,
            test_validator_set(&keys),
            begin,
            Arc::new(PrivValidator::new(test_key(0))),
        );
        (chain, agent)
    }

    #[test]
    fn test_make_block_enforces_window() {
        let (_chain, agent) = agent_at(10, 5);
        assert_eq!(agent.make_block(&[]).unwrap().height, 11);

        agent.set_end_height(10);
        assert!(matches!(
            agent.make_block(&[]),
            Err(StateAgentError::OutOfRange {
                height: 11,
                end: 10,
                ..
            })
        ));

        let (_chain, late) = agent_at(2, 5);
        assert!(matches!(
            late.make_block(&[]),
            Err(StateAgentError::OutOfRange { begin: 5, .. })
        ));
    }

    #[test]
    fn test_set_begin_height_needs_end() {
        let (_chain, agent) = agent_at(0, 5);
        agent.set_begin_height(3);
        assert_eq!(agent.begin_height(), 5);

        agent.set_end_height(20);
        agent.set_begin_height(3);
        assert_eq!(agent.begin_height(), 3);
        agent.set_begin_height(25);
        assert_eq!(agent.begin_height(), 3);
    }

    #[test]
    fn test_validate_block_returns_agent_verdict() {
        let (chain, agent) = agent_at(0, 1);
        let block = agent.make_block(&[]).unwrap();
        let sign = agent.validate_block(&block, true).unwrap();
        assert_eq!(sign.hash, block.hash());
        assert_eq!(sign.result, SignResult::Agree);

        chain.set_verify_error(Some("bad state root".into()));
        assert!(matches!(
            agent.validate_block(&block, true),
            Err(StateAgentError::Agent(ChainAgentError::VerifyFailed(_)))
        ));
    }

    #[test]
    fn test_consensus_commit_surfaces_agent_error() {
        let (chain, agent) = agent_at(0, 1);
        let block = agent.make_block(&[]).unwrap();
        chain.set_commit_error(Some("busy".into()));
        assert!(matches!(
            agent.consensus_commit(&block),
            Err(StateAgentError::Agent(ChainAgentError::BroadcastFailed(_)))
        ));
        assert!(chain.committed().is_empty());

        chain.set_commit_error(None);
        agent.consensus_commit(&block).unwrap();
        assert_eq!(chain.committed(), vec![block]);
        assert_eq!(agent.get_last_block_height(), 1);
    }

    #[test]
    fn test_latency_is_observed() {
        let (_chain, agent) = agent_at(0, 1);
        let observer = Arc::new(RecordingObserver::default());
        let agent = agent.with_observer(observer.clone());
        let block = agent.make_block(&[]).unwrap();
        agent.validate_block(&block, true).unwrap();
        agent.consensus_commit(&block).unwrap();
        assert_eq!(
            *observer.samples.lock(),
            vec![
                (AgentCall::FetchBlock, true),
                (AgentCall::VerifyBlock, true),
                (AgentCall::BroadcastConsensus, true),
            ]
        );
    }

    #[test]
    fn test_update_validator_refreshes_ids() {
        let (_chain, agent) = agent_at(0, 1);
        let outsider = PeerId::from_address(&test_key(9).address());
        assert!(agent.has_peer_id(&outsider).is_err());

        let mut keys = test_keys(3);
        keys.push(test_key(9));
        agent.update_validator(test_validator_set(&keys), false);
        assert!(agent.has_peer_id(&outsider).is_err());
        assert_eq!(agent.validators_generation(), 1);

        agent.update_validator(test_validator_set(&keys), true);
        assert!(agent.has_peer_id(&outsider).is_ok());
        assert!(agent
            .has_peer_id(&PeerId::from_address(&test_key(3).address()))
            .is_err());
    }

    #[test]
    fn test_last_validator_address_follows_chain() {
        let (_chain, agent) = agent_at(0, 1);
        assert_eq!(agent.get_last_validator_address(), Address::default());

        let proposer = test_key(2).address();
        let block = Block::new(1, Hash::ZERO, proposer, 1000, vec![1]);
        agent.consensus_commit(&block).unwrap();
        assert_eq!(agent.get_last_validator_address(), proposer);
    }

    #[test]
    fn test_priv_reset_forgets_signed_heights() {
        let (_chain, agent) = agent_at(0, 1);
        let vote_at = |height| {
            Vote::new(agent.address(), 0, height, 0, 0, VoteType::Prevote, BlockId::nil())
        };
        agent.sign_vote(&mut vote_at(5)).unwrap();

        let mut earlier = vote_at(3);
        assert!(matches!(
            agent.sign_vote(&mut earlier),
            Err(StateAgentError::Sign(SignError::HeightRegression {
                last: 5,
                requested: 3
            }))
        ));
        assert!(earlier.signature.is_zero());

        agent.priv_reset();
        agent.sign_vote(&mut earlier).unwrap();
        assert!(!earlier.signature.is_zero());
    }
}

//! Round-based consensus state machine.
//!
//! This module implements the height/round/step machine as a synchronous,
//! event-driven model. Timers and network I/O belong to the runner.

use crate::config::ConsensusConfig;
use crate::height_vote_set::{HeightVoteSet, HeightVoteSetError};
use crate::state_agent::StateAgent;
use crate::vote_set::VoteSet;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tbft_core::{Action, Event, OutboundMessage, RoundStep, StateMachine, TimeoutInfo};
use tbft_types::{
    block_from_part_set, Address, Block, BlockId, Hash, KeepBlockSign, Part, PartSet,
    PartSetHeader, PeerId, Proposal, SignResult, ValidatorSet, Vote, VoteType,
};
use tracing::{debug, info, instrument, trace, warn};

/// Network events buffered for the next height.
const MAX_FUTURE_EVENTS: usize = 1024;

/// Block parts buffered before their proposal or commit header is known.
const MAX_EARLY_PARTS: usize = 1024;

/// Proposals buffered for rounds we have not reached.
const MAX_FUTURE_PROPOSALS: usize = 4;

/// Consensus statistics for monitoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsensusStats {
    /// Rounds entered above round 0.
    pub round_changes: u64,
    pub committed_blocks: u64,
    pub commit_failures: u64,
    pub conflicting_votes: u64,
    pub unwanted_round_votes: u64,
    pub timeouts_fired: u64,
}

/// Serializable view of the round state, for status queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoundStateSnapshot {
    pub committee_id: u64,
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    pub proposer: Address,
    pub is_proposer: bool,
    pub locked_round: Option<u32>,
    pub committed_height: u64,
    pub begin_height: u64,
    pub end_height: u64,
    pub validators: usize,
    pub finished: bool,
    pub stats: ConsensusStats,
}

/// Consensus state machine for one committee.
///
/// # State Machine Flow
///
/// 1. **NewHeight** → after `timeout_commit`, enter round 0
/// 2. **Propose** → the round's proposer broadcasts a proposal and its parts
/// 3. **Prevote** → vote for the locked block, the verified proposal, or nil
/// 4. **Precommit** → vote for the block that got +2/3 prevotes, or nil
/// 5. **Commit** → +2/3 precommits for a block; hand it to the chain agent
///
/// Timeouts at Propose, PrevoteWait and PrecommitWait move the round along
/// when votes are missing.
pub struct ConsensusState {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    config: ConsensusConfig,
    agent: Arc<StateAgent>,
    chain_id: String,
    address: Address,

    // ═══════════════════════════════════════════════════════════════════════
    // Round State
    // ═══════════════════════════════════════════════════════════════════════
    height: u64,
    round: u32,
    step: RoundStep,

    /// Validator set of the current height.
    validators: ValidatorSet,
    /// `validators` advanced by `round + 1`; its proposer leads this round.
    round_validators: ValidatorSet,
    /// Agent generation `validators` was derived from.
    validators_generation: u64,

    proposal: Option<Proposal>,
    proposal_block: Option<Block>,
    proposal_block_parts: Option<PartSet>,

    locked_round: Option<u32>,
    locked_block: Option<Block>,
    locked_block_parts: Option<PartSet>,

    votes: HeightVoteSet,
    commit_round: Option<u32>,
    triggered_timeout_precommit: bool,

    // ═══════════════════════════════════════════════════════════════════════
    // Previous Height
    // ═══════════════════════════════════════════════════════════════════════
    /// Last height successfully handed to the chain agent.
    committed_height: u64,
    /// Precommits that committed the previous height.
    last_commit: Option<VoteSet>,
    last_block_parts: Option<PartSet>,
    /// When each lagging peer was last sent catch-up data.
    helped: HashMap<PeerId, Duration>,

    // ═══════════════════════════════════════════════════════════════════════
    // Buffers
    // ═══════════════════════════════════════════════════════════════════════
    early_parts: HashMap<PartSetHeader, Vec<Part>>,
    early_parts_count: usize,
    future_proposals: BTreeMap<u32, (Proposal, PeerId)>,
    future_events: VecDeque<Event>,

    // ═══════════════════════════════════════════════════════════════════════
    // Bookkeeping
    // ═══════════════════════════════════════════════════════════════════════
    started: bool,
    /// The committee's window is exhausted; every event is ignored.
    finished: bool,
    now: Duration,
    stats: ConsensusStats,
}

impl std::fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusState")
            .field("height", &self.height)
            .field("round", &self.round)
            .field("step", &self.step)
            .field("locked_round", &self.locked_round)
            .field("committed_height", &self.committed_height)
            .finish()
    }
}

fn block_id_of(block: &Block, parts: &PartSet) -> BlockId {
    BlockId::new(block.hash(), parts.header())
}

impl ConsensusState {
    pub fn new(config: ConsensusConfig, agent: Arc<StateAgent>) -> Self {
        let chain_id = agent.chain_id().to_string();
        let address = agent.address();
        let validators = agent.validators();
        let validators_generation = agent.validators_generation();
        let height = agent.begin_height();
        Self {
            config,
            chain_id: chain_id.clone(),
            address,
            height,
            round: 0,
            step: RoundStep::NewHeight,
            round_validators: validators.clone(),
            votes: HeightVoteSet::new(chain_id, height, validators.clone()),
            validators,
            validators_generation,
            agent,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            commit_round: None,
            triggered_timeout_precommit: false,
            committed_height: 0,
            last_commit: None,
            last_block_parts: None,
            helped: HashMap::new(),
            early_parts: HashMap::new(),
            early_parts_count: 0,
            future_proposals: BTreeMap::new(),
            future_events: VecDeque::new(),
            started: false,
            finished: false,
            now: Duration::ZERO,
            stats: ConsensusStats::default(),
        }
    }

    /// Enter round 0 of the height after the chain's current one.
    pub fn start(&mut self) -> Vec<Action> {
        let height = self.agent.get_last_block_height() + 1;
        info!(
            committee_id = self.agent.committee_id(),
            height,
            validators = self.agent.validators().len(),
            "Starting consensus"
        );
        self.started = true;
        self.committed_height = height - 1;
        self.update_to_height(height);
        if self.finished {
            return vec![];
        }
        self.enter_new_round(height, 0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn step(&self) -> RoundStep {
        self.step
    }

    pub fn committed_height(&self) -> u64 {
        self.committed_height
    }

    pub fn locked_round(&self) -> Option<u32> {
        self.locked_round
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn agent(&self) -> &Arc<StateAgent> {
        &self.agent
    }

    pub fn votes(&self) -> &HeightVoteSet {
        &self.votes
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the local validator proposes in the current round.
    pub fn is_proposer(&self) -> bool {
        self.round_validators.get_proposer().address == self.address
    }

    pub fn snapshot(&self) -> RoundStateSnapshot {
        RoundStateSnapshot {
            committee_id: self.agent.committee_id(),
            height: self.height,
            round: self.round,
            step: self.step,
            proposer: self.round_validators.get_proposer().address,
            is_proposer: self.is_proposer(),
            locked_round: self.locked_round,
            committed_height: self.committed_height,
            begin_height: self.agent.begin_height(),
            end_height: self.agent.end_height(),
            validators: self.validators.len(),
            finished: self.finished,
            stats: self.stats,
        }
    }

    fn now_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }

    fn schedule(&self, duration: Duration, round: u32, step: RoundStep) -> Action {
        Action::ScheduleTimeout {
            timeout: TimeoutInfo::new(duration, self.height, round, step),
        }
    }

    fn penalize(peer: &PeerId, reason: String) -> Vec<Action> {
        if peer.is_local() {
            return vec![];
        }
        vec![Action::PenalizePeer {
            peer: peer.clone(),
            reason,
        }]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Height transitions
    // ═══════════════════════════════════════════════════════════════════════

    /// Validator set for `height`: one proposer step per height since the
    /// committee began, restarted from the agent's set when it changed.
    fn validators_for_height(&mut self, height: u64) -> ValidatorSet {
        let generation = self.agent.validators_generation();
        if generation == self.validators_generation && height == self.height + 1 {
            return self.validators.copy_increment_accum(1);
        }
        self.validators_generation = generation;
        let steps = height.saturating_sub(self.agent.begin_height());
        self.agent.validators().copy_advance(steps)
    }

    /// Reset round state for `height` and replay anything buffered for it.
    fn update_to_height(&mut self, height: u64) -> Vec<Action> {
        let validators = self.validators_for_height(height);
        self.height = height;
        self.round = 0;
        self.step = RoundStep::NewHeight;
        self.round_validators = validators.copy_increment_accum(1);
        self.votes.reset(height, validators.clone());
        self.validators = validators;

        self.proposal = None;
        self.proposal_block = None;
        self.proposal_block_parts = None;
        self.locked_round = None;
        self.locked_block = None;
        self.locked_block_parts = None;
        self.commit_round = None;
        self.triggered_timeout_precommit = false;
        self.helped.clear();
        self.early_parts.clear();
        self.early_parts_count = 0;
        self.future_proposals.clear();

        let end = self.agent.end_height();
        if end > 0 && height > end {
            info!(
                committee_id = self.agent.committee_id(),
                height, end, "Committee window exhausted"
            );
            self.finished = true;
            self.future_events.clear();
            return vec![];
        }

        let buffered: Vec<Event> = self.future_events.drain(..).collect();
        let mut actions = Vec::new();
        for event in buffered {
            if event.height() == Some(height) {
                actions.extend(self.dispatch(event));
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Round steps
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(level = "debug", skip(self))]
    fn enter_new_round(&mut self, height: u64, round: u32) -> Vec<Action> {
        if self.height != height
            || round < self.round
            || (self.round == round && self.step != RoundStep::NewHeight)
        {
            trace!(
                current_round = self.round,
                step = %self.step,
                "Ignoring new round"
            );
            return vec![];
        }

        debug!(height, round, "Entering new round");
        if round > 0 {
            self.stats.round_changes += 1;
        }
        self.round_validators = self.validators.copy_increment_accum(round + 1);
        self.round = round;
        self.step = RoundStep::NewRound;
        if round > 0 {
            self.proposal = None;
            self.proposal_block = None;
            self.proposal_block_parts = None;
        }
        self.votes.set_round(round + 1);
        self.triggered_timeout_precommit = false;

        let mut actions = Vec::new();
        let stale: Vec<u32> = self
            .future_proposals
            .range(..=round)
            .map(|(r, _)| *r)
            .collect();
        for r in stale {
            if let Some((proposal, peer)) = self.future_proposals.remove(&r) {
                if r == round {
                    actions.extend(self.on_proposal(proposal, &peer));
                }
            }
        }
        actions.extend(self.enter_propose(height, round));
        actions
    }

    fn enter_propose(&mut self, height: u64, round: u32) -> Vec<Action> {
        if self.height != height
            || round < self.round
            || (self.round == round && self.step >= RoundStep::Propose)
        {
            return vec![];
        }
        self.step = RoundStep::Propose;

        let mut actions = vec![self.schedule(
            self.config.propose_timeout(round),
            round,
            RoundStep::Propose,
        )];
        if self.is_proposer() {
            actions.extend(self.decide_proposal(height, round));
        }
        if self.is_proposal_complete() {
            actions.extend(self.enter_prevote(height, round));
        }
        actions
    }

    /// Build, sign and broadcast this round's proposal.
    fn decide_proposal(&mut self, height: u64, round: u32) -> Vec<Action> {
        let (block, parts) = match (&self.locked_block, &self.locked_block_parts) {
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => match self.fetch_block(height) {
                Some(fetched) => fetched,
                None => return vec![],
            },
        };

        let (pol_round, pol_block_id) = match self.votes.pol_info() {
            Some((pol_round, block_id)) if pol_round < round => (Some(pol_round), block_id),
            _ => (None, BlockId::nil()),
        };
        let mut proposal = Proposal::new(
            height,
            round,
            self.now_ms(),
            parts.header(),
            pol_round,
            pol_block_id,
        );
        if let Err(e) = self.agent.sign_proposal(&mut proposal) {
            warn!(height, round, error = %e, "Failed to sign proposal");
            return vec![];
        }

        info!(
            height,
            round,
            block = %block,
            pol_round = ?pol_round,
            "Proposing block"
        );

        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::Proposal(proposal.clone()),
        }];
        actions.extend(Self::part_messages(height, round, &parts));

        self.proposal = Some(proposal);
        self.proposal_block = Some(block);
        self.proposal_block_parts = Some(parts);
        actions
    }

    fn fetch_block(&self, height: u64) -> Option<(Block, PartSet)> {
        let block = match self.agent.make_block(&self.agent.seed_members()) {
            Ok(block) => block,
            Err(e) => {
                warn!(height, error = %e, "Chain agent could not build a block");
                return None;
            }
        };
        if block.height != height {
            warn!(
                height,
                block_height = block.height,
                "Chain agent built a block for another height"
            );
            return None;
        }
        match self
            .agent
            .make_part_set(self.config.block_part_size, &block)
        {
            Ok(parts) => Some((block, parts)),
            Err(e) => {
                warn!(height, error = %e, "Failed to split block into parts");
                None
            }
        }
    }

    fn part_messages(height: u64, round: u32, parts: &PartSet) -> Vec<Action> {
        let header = parts.header();
        (0..parts.total())
            .filter_map(|i| parts.get_part(i))
            .map(|part| Action::Broadcast {
                message: OutboundMessage::BlockPart {
                    height,
                    round,
                    header,
                    part: part.clone(),
                },
            })
            .collect()
    }

    /// Proposal and its block are both present, and its POL (if any) is
    /// backed by +2/3 prevotes we have seen.
    fn is_proposal_complete(&self) -> bool {
        let (Some(proposal), Some(_)) = (&self.proposal, &self.proposal_block) else {
            return false;
        };
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .votes
                .prevotes(pol_round)
                .is_some_and(VoteSet::has_two_thirds_majority),
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn enter_prevote(&mut self, height: u64, round: u32) -> Vec<Action> {
        if self.height != height
            || round < self.round
            || (self.round == round && self.step >= RoundStep::Prevote)
        {
            return vec![];
        }
        self.round = round;
        self.step = RoundStep::Prevote;

        let mut actions = vec![self.schedule(
            self.config.prevote_timeout(round),
            round,
            RoundStep::Prevote,
        )];
        actions.extend(self.do_prevote(round));
        actions
    }

    fn do_prevote(&mut self, round: u32) -> Vec<Action> {
        if let (Some(block), Some(parts)) = (&self.locked_block, &self.locked_block_parts) {
            let block_id = block_id_of(block, parts);
            let block = block.clone();
            debug!(round, block_id = %block_id, "Prevoting locked block");
            return match self.block_sign(&block, round) {
                Some(sign) => self.sign_add_vote(VoteType::Prevote, block_id, Some(sign)),
                None => self.sign_add_vote(VoteType::Prevote, BlockId::nil(), None),
            };
        }

        let (Some(block), Some(parts)) = (&self.proposal_block, &self.proposal_block_parts) else {
            debug!(round, "No proposal block, prevoting nil");
            return self.sign_add_vote(VoteType::Prevote, BlockId::nil(), None);
        };
        let block_id = block_id_of(block, parts);
        let block = block.clone();
        match self.block_sign(&block, round) {
            Some(sign) => self.sign_add_vote(VoteType::Prevote, block_id, Some(sign)),
            None => self.sign_add_vote(VoteType::Prevote, BlockId::nil(), None),
        }
    }

    /// The chain agent's approval of `block`: the verdict already carried by
    /// one of our prevotes, or a fresh verification. `None` unless approved.
    fn block_sign(&self, block: &Block, round: u32) -> Option<KeepBlockSign> {
        let hash = block.hash();
        let sign = match self.votes.get_signs_from_vote(round, &hash, &self.address) {
            Some(sign) => sign,
            None => match self.agent.validate_block(block, true) {
                Ok(sign) => sign,
                Err(e) => {
                    warn!(height = block.height, error = %e, "Block failed validation");
                    return None;
                }
            },
        };
        if sign.result != SignResult::Agree {
            info!(height = block.height, "Chain agent voted against block");
            return None;
        }
        Some(sign)
    }

    fn enter_prevote_wait(&mut self, height: u64, round: u32) -> Vec<Action> {
        if self.height != height
            || round < self.round
            || (self.round == round && self.step >= RoundStep::PrevoteWait)
        {
            return vec![];
        }
        if !self
            .votes
            .prevotes(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            return vec![];
        }
        self.round = round;
        self.step = RoundStep::PrevoteWait;
        vec![self.schedule(
            self.config.prevote_timeout(round),
            round,
            RoundStep::PrevoteWait,
        )]
    }

    #[instrument(level = "debug", skip(self))]
    fn enter_precommit(&mut self, height: u64, round: u32) -> Vec<Action> {
        if self.height != height
            || round < self.round
            || (self.round == round && self.step >= RoundStep::Precommit)
        {
            return vec![];
        }
        self.round = round;
        self.step = RoundStep::Precommit;

        let mut actions = vec![self.schedule(
            self.config.precommit_timeout(round),
            round,
            RoundStep::Precommit,
        )];

        let maj23 = self
            .votes
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority);
        let Some(block_id) = maj23 else {
            debug!(round, "No +2/3 prevotes, precommitting nil");
            actions.extend(self.sign_add_vote(VoteType::Precommit, BlockId::nil(), None));
            return actions;
        };

        if block_id.is_nil() {
            if self.locked_round.is_some() {
                debug!(round, "+2/3 prevoted nil, unlocking");
            }
            self.unlock();
            actions.extend(self.sign_add_vote(VoteType::Precommit, BlockId::nil(), None));
            return actions;
        }

        if let Some(block) = self
            .locked_block
            .as_ref()
            .filter(|b| b.hash() == block_id.hash)
            .cloned()
        {
            debug!(round, block_id = %block_id, "Relocking block");
            self.locked_round = Some(round);
            let sign = self.block_sign(&block, round);
            actions.extend(self.precommit_block(block_id, sign));
            return actions;
        }

        if let Some(block) = self
            .proposal_block
            .as_ref()
            .filter(|b| b.hash() == block_id.hash)
            .cloned()
        {
            let sign = self.block_sign(&block, round);
            if sign.is_some() {
                debug!(round, block_id = %block_id, "Locking block");
                self.locked_round = Some(round);
                self.locked_block = Some(block);
                self.locked_block_parts = self.proposal_block_parts.clone();
            }
            actions.extend(self.precommit_block(block_id, sign));
            return actions;
        }

        // +2/3 for a block we do not have; fetch its parts, vote nil.
        debug!(round, block_id = %block_id, "+2/3 prevoted unknown block");
        self.unlock();
        if !self
            .proposal_block_parts
            .as_ref()
            .is_some_and(|p| p.has_header(&block_id.parts))
        {
            actions.extend(self.expect_block_parts(block_id.parts));
        }
        actions.extend(self.sign_add_vote(VoteType::Precommit, BlockId::nil(), None));
        actions
    }

    fn precommit_block(&mut self, block_id: BlockId, sign: Option<KeepBlockSign>) -> Vec<Action> {
        match sign {
            Some(sign) => self.sign_add_vote(VoteType::Precommit, block_id, Some(sign)),
            None => self.sign_add_vote(VoteType::Precommit, BlockId::nil(), None),
        }
    }

    fn unlock(&mut self) {
        self.locked_round = None;
        self.locked_block = None;
        self.locked_block_parts = None;
    }

    fn enter_precommit_wait(&mut self, height: u64, round: u32) -> Vec<Action> {
        if self.height != height
            || round < self.round
            || (self.round == round && self.triggered_timeout_precommit)
        {
            return vec![];
        }
        if !self
            .votes
            .precommits(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            return vec![];
        }
        self.round = round;
        self.step = RoundStep::PrecommitWait;
        self.triggered_timeout_precommit = true;
        vec![self.schedule(
            self.config.precommit_timeout(round),
            round,
            RoundStep::PrecommitWait,
        )]
    }

    #[instrument(level = "debug", skip(self))]
    fn enter_commit(&mut self, height: u64, commit_round: u32) -> Vec<Action> {
        if self.height != height || self.step >= RoundStep::Commit {
            return vec![];
        }
        let Some(block_id) = self
            .votes
            .precommits(commit_round)
            .and_then(VoteSet::two_thirds_majority)
            .filter(|id| !id.is_nil())
        else {
            warn!(commit_round, "Entering commit without +2/3 precommits");
            return vec![];
        };

        self.step = RoundStep::Commit;
        self.commit_round = Some(commit_round);

        if self
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hash() == block_id.hash)
        {
            self.proposal_block = self.locked_block.clone();
            self.proposal_block_parts = self.locked_block_parts.clone();
        }

        let mut actions = vec![self.schedule(
            self.config.commit_timeout(),
            self.round,
            RoundStep::Commit,
        )];
        let have_block = self
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hash() == block_id.hash);
        if !have_block
            && !self
                .proposal_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&block_id.parts))
        {
            debug!(block_id = %block_id, "Committing a block we do not have yet");
            actions.extend(self.expect_block_parts(block_id.parts));
        }
        actions.extend(self.try_finalize_commit(height));
        actions
    }

    /// Hand the committed block to the chain agent once it is assembled.
    fn try_finalize_commit(&mut self, height: u64) -> Vec<Action> {
        if self.height != height || self.step != RoundStep::Commit {
            return vec![];
        }
        let Some(commit_round) = self.commit_round else {
            return vec![];
        };
        let Some(block_id) = self
            .votes
            .precommits(commit_round)
            .and_then(VoteSet::two_thirds_majority)
        else {
            return vec![];
        };
        let Some(block) = self
            .proposal_block
            .as_ref()
            .filter(|b| b.hash() == block_id.hash)
            .cloned()
        else {
            debug!(height, "Waiting for the committed block's parts");
            return vec![];
        };
        if self.committed_height >= height {
            return vec![];
        }

        if let Err(e) = self.agent.consensus_commit(&block) {
            warn!(height, commit_round, error = %e, "Chain agent rejected committed block");
            self.stats.commit_failures += 1;
            // Leave Commit so the round guards admit the next round.
            self.step = RoundStep::PrecommitWait;
            self.commit_round = None;
            return self.enter_new_round(height, self.round.max(commit_round) + 1);
        }

        info!(
            height,
            round = commit_round,
            block = %block,
            "Committed block"
        );
        self.committed_height = height;
        self.stats.committed_blocks += 1;
        self.last_commit = self.votes.precommits(commit_round).cloned();
        self.last_block_parts = self.proposal_block_parts.clone();

        let mut actions = vec![Action::BlockCommitted {
            height,
            round: commit_round,
            block_hash: block.hash(),
        }];
        actions.extend(self.update_to_height(height + 1));
        if self.finished {
            return actions;
        }
        if self.config.skip_timeout_commit {
            actions.extend(self.enter_new_round(height + 1, 0));
        } else {
            actions.push(self.schedule(self.config.commit_timeout(), 0, RoundStep::NewHeight));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposals and block parts
    // ═══════════════════════════════════════════════════════════════════════

    fn on_proposal(&mut self, proposal: Proposal, peer: &PeerId) -> Vec<Action> {
        if proposal.height != self.height || proposal.round < self.round {
            return vec![];
        }
        if let Err(e) = proposal.block_parts.validate(self.config.block_part_size) {
            warn!(peer = %peer, parts = %proposal.block_parts, error = %e, "Proposal with invalid part set header");
            return Self::penalize(peer, e.to_string());
        }
        if proposal.round > self.round {
            return self.buffer_future_proposal(proposal, peer);
        }
        if self.proposal.is_some() {
            return vec![];
        }
        if proposal.pol_round.is_some_and(|pol| pol >= proposal.round) {
            debug!(peer = %peer, pol_round = ?proposal.pol_round, "Proposal with invalid POL round");
            return vec![];
        }

        let proposer = self.round_validators.get_proposer().public_key;
        if let Err(e) = proposal.verify(&self.chain_id, &proposer) {
            warn!(
                height = proposal.height,
                round = proposal.round,
                peer = %peer,
                error = %e,
                "Rejecting proposal"
            );
            return vec![];
        }

        debug!(
            height = proposal.height,
            round = proposal.round,
            parts = %proposal.block_parts,
            "Accepted proposal"
        );
        let header = proposal.block_parts;
        self.proposal = Some(proposal);

        let mut actions = Vec::new();
        let have_parts = self
            .proposal_block_parts
            .as_ref()
            .is_some_and(|p| p.has_header(&header));
        if !have_parts {
            if self
                .locked_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&header))
            {
                self.proposal_block = self.locked_block.clone();
                self.proposal_block_parts = self.locked_block_parts.clone();
            } else {
                actions.extend(self.expect_block_parts(header));
            }
        }
        if self.proposal_block.is_some() {
            actions.extend(self.on_block_complete());
        }
        actions
    }

    /// Keep a proposal for one of the next few rounds, if that round's
    /// proposer signed it.
    fn buffer_future_proposal(&mut self, proposal: Proposal, peer: &PeerId) -> Vec<Action> {
        let round = proposal.round;
        if round - self.round > MAX_FUTURE_PROPOSALS as u32
            || self.future_proposals.contains_key(&round)
            || self.future_proposals.len() >= MAX_FUTURE_PROPOSALS
        {
            return vec![];
        }
        let proposer = self
            .validators
            .copy_increment_accum(round + 1)
            .get_proposer()
            .public_key;
        if let Err(e) = proposal.verify(&self.chain_id, &proposer) {
            debug!(round, peer = %peer, error = %e, "Dropping unverifiable future proposal");
            return vec![];
        }
        trace!(round, "Buffering proposal for a later round");
        self.future_proposals.insert(round, (proposal, peer.clone()));
        vec![]
    }

    /// Start collecting parts for `header`, picking up any that arrived early.
    fn expect_block_parts(&mut self, header: PartSetHeader) -> Vec<Action> {
        self.proposal_block = None;
        match PartSet::new_from_header(header, self.config.block_part_size) {
            Ok(parts) => {
                self.proposal_block_parts = Some(parts);
                self.drain_early_parts(header)
            }
            Err(e) => {
                warn!(parts = %header, error = %e, "Cannot collect parts for block");
                self.proposal_block_parts = None;
                vec![]
            }
        }
    }

    fn drain_early_parts(&mut self, header: PartSetHeader) -> Vec<Action> {
        let Some(parts) = self.early_parts.remove(&header) else {
            return vec![];
        };
        self.early_parts_count -= parts.len();
        let mut actions = Vec::new();
        for part in parts {
            actions.extend(self.add_block_part(header, part));
        }
        actions
    }

    fn on_block_part(&mut self, header: PartSetHeader, part: Part, peer: &PeerId) -> Vec<Action> {
        let matches = self
            .proposal_block_parts
            .as_ref()
            .is_some_and(|p| p.has_header(&header));
        if !matches {
            if self.early_parts_count < MAX_EARLY_PARTS {
                self.early_parts.entry(header).or_default().push(part);
                self.early_parts_count += 1;
            } else {
                trace!(peer = %peer, "Early part buffer full, dropping part");
            }
            return vec![];
        }
        self.add_block_part(header, part)
    }

    fn add_block_part(&mut self, header: PartSetHeader, part: Part) -> Vec<Action> {
        let Some(parts) = self
            .proposal_block_parts
            .as_mut()
            .filter(|p| p.has_header(&header))
        else {
            return vec![];
        };
        match parts.add_part(part) {
            Ok(true) if parts.is_complete() => {}
            Ok(_) => return vec![],
            Err(e) => {
                debug!(header = %header, error = %e, "Dropping block part");
                return vec![];
            }
        }

        match block_from_part_set(parts) {
            Ok(block) if block.height == self.height => {
                debug!(block = %block, "Received complete proposal block");
                self.proposal_block = Some(block);
                self.on_block_complete()
            }
            Ok(block) => {
                warn!(
                    height = self.height,
                    block_height = block.height,
                    "Assembled block for another height"
                );
                vec![]
            }
            Err(e) => {
                warn!(header = %header, error = %e, "Failed to decode proposal block");
                vec![]
            }
        }
    }

    fn on_block_complete(&mut self) -> Vec<Action> {
        if self.step <= RoundStep::Propose && self.is_proposal_complete() {
            self.enter_prevote(self.height, self.round)
        } else if self.step == RoundStep::Commit {
            self.try_finalize_commit(self.height)
        } else {
            vec![]
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Votes
    // ═══════════════════════════════════════════════════════════════════════

    fn sign_add_vote(
        &mut self,
        vote_type: VoteType,
        block_id: BlockId,
        sign: Option<KeepBlockSign>,
    ) -> Vec<Action> {
        let Some((index, _)) = self.validators.get_by_address(&self.address) else {
            return vec![];
        };
        let mut vote = Vote::new(
            self.address,
            index,
            self.height,
            self.round,
            self.now_ms(),
            vote_type,
            block_id,
        );
        if let Some(sign) = &sign {
            vote = vote.with_block_sign(sign);
        }
        if let Err(e) = self.agent.sign_vote(&mut vote) {
            warn!(vote = %vote, error = %e, "Failed to sign vote");
            return vec![];
        }
        trace!(vote = %vote, "Signed vote");

        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::Vote(vote.clone()),
        }];
        actions.extend(self.try_add_vote(vote, &PeerId::local()));
        actions
    }

    fn try_add_vote(&mut self, vote: Vote, peer: &PeerId) -> Vec<Action> {
        if vote.height + 1 == self.height {
            return self.on_previous_height_vote(vote, peer);
        }
        if vote.height != self.height {
            trace!(vote = %vote, height = self.height, "Ignoring vote for another height");
            return vec![];
        }

        match self.votes.add_vote(&vote, peer) {
            Ok(true) => self.on_vote_added(&vote),
            Ok(false) => vec![],
            Err(HeightVoteSetError::UnwantedRoundVote { round, .. }) => {
                self.stats.unwanted_round_votes += 1;
                debug!(peer = %peer, round, "Vote for unwanted round");
                Self::penalize(peer, format!("vote for unwanted round {round}"))
            }
            Err(HeightVoteSetError::VoteSet(e)) if e.is_equivocation() => {
                self.stats.conflicting_votes += 1;
                warn!(peer = %peer, error = %e, "Conflicting vote");
                Self::penalize(peer, e.to_string())
            }
            Err(e) => {
                debug!(peer = %peer, vote = %vote, error = %e, "Dropping invalid vote");
                vec![]
            }
        }
    }

    /// A vote for the height we just committed: late precommits join the
    /// last commit, and the sender is still behind, so help it finish.
    fn on_previous_height_vote(&mut self, vote: Vote, peer: &PeerId) -> Vec<Action> {
        if vote.vote_type == VoteType::Precommit {
            if let Some(last_commit) = self.last_commit.as_mut() {
                if vote.round == last_commit.round() {
                    if let Err(e) = last_commit.add_vote(&vote) {
                        if e.is_equivocation() {
                            self.stats.conflicting_votes += 1;
                            return Self::penalize(peer, e.to_string());
                        }
                        debug!(vote = %vote, error = %e, "Dropping late precommit");
                    }
                }
            }
        }
        self.help_lagging_peer(peer)
    }

    fn help_lagging_peer(&mut self, peer: &PeerId) -> Vec<Action> {
        if peer.is_local() {
            return vec![];
        }
        let (Some(last_commit), Some(parts)) = (&self.last_commit, &self.last_block_parts) else {
            return vec![];
        };
        if let Some(at) = self.helped.get(peer) {
            if self.now.saturating_sub(*at) < self.config.commit_timeout() {
                return vec![];
            }
        }

        debug!(peer = %peer, height = last_commit.height(), "Sending catch-up to lagging peer");
        let height = last_commit.height();
        let round = last_commit.round();
        let mut actions: Vec<Action> = last_commit
            .iter()
            .map(|v| Action::SendTo {
                peer: peer.clone(),
                message: OutboundMessage::Vote(v.clone()),
            })
            .collect();
        actions.extend(
            Self::part_messages(height, round, parts)
                .into_iter()
                .filter_map(|a| match a {
                    Action::Broadcast { message } => Some(Action::SendTo {
                        peer: peer.clone(),
                        message,
                    }),
                    _ => None,
                }),
        );
        self.helped.insert(peer.clone(), self.now);
        actions
    }

    fn on_vote_added(&mut self, vote: &Vote) -> Vec<Action> {
        let height = self.height;
        match vote.vote_type {
            VoteType::Prevote => {
                let Some(prevotes) = self.votes.prevotes(vote.round) else {
                    return vec![];
                };
                let maj23 = prevotes.two_thirds_majority();
                let two_thirds_any = prevotes.has_two_thirds_any();

                // A newer POL for another block releases our lock.
                if let (Some(block_id), Some(locked_round), Some(locked)) =
                    (maj23, self.locked_round, &self.locked_block)
                {
                    if locked_round < vote.round
                        && vote.round <= self.round
                        && locked.hash() != block_id.hash
                    {
                        debug!(locked_round, pol_round = vote.round, "Unlocking on newer POL");
                        self.unlock();
                    }
                }

                if self.round < vote.round && two_thirds_any {
                    self.enter_new_round(height, vote.round)
                } else if self.round == vote.round && self.step >= RoundStep::Prevote {
                    match maj23 {
                        Some(block_id) if block_id.is_nil() || self.is_proposal_complete() => {
                            self.enter_precommit(height, vote.round)
                        }
                        _ if two_thirds_any => self.enter_prevote_wait(height, vote.round),
                        _ => vec![],
                    }
                } else if self
                    .proposal
                    .as_ref()
                    .is_some_and(|p| p.pol_round == Some(vote.round))
                    && self.is_proposal_complete()
                {
                    self.enter_prevote(height, self.round)
                } else {
                    vec![]
                }
            }
            VoteType::Precommit => {
                let Some(precommits) = self.votes.precommits(vote.round) else {
                    return vec![];
                };
                let maj23 = precommits.two_thirds_majority();
                let two_thirds_any = precommits.has_two_thirds_any();

                match maj23 {
                    Some(block_id) if !block_id.is_nil() => {
                        let mut actions = self.enter_new_round(height, vote.round);
                        actions.extend(self.enter_precommit(height, vote.round));
                        actions.extend(self.enter_commit(height, vote.round));
                        actions
                    }
                    Some(_) if vote.round >= self.round && self.step < RoundStep::Commit => {
                        debug!(round = vote.round, "+2/3 precommitted nil");
                        let mut actions = self.enter_new_round(height, vote.round);
                        actions.extend(self.enter_precommit(height, vote.round));
                        actions.extend(self.enter_new_round(height, vote.round + 1));
                        actions
                    }
                    _ if self.round <= vote.round && two_thirds_any => {
                        let mut actions = self.enter_new_round(height, vote.round);
                        actions.extend(self.enter_precommit_wait(height, vote.round));
                        actions
                    }
                    _ => vec![],
                }
            }
        }
    }

    /// Re-send our own votes for the current round, and our proposal if we
    /// lead it. Covers messages lost in transit.
    fn rebroadcast_own(&self, round: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_proposer() {
            if let (Some(proposal), Some(parts)) = (&self.proposal, &self.proposal_block_parts) {
                if proposal.round == round {
                    actions.push(Action::Broadcast {
                        message: OutboundMessage::Proposal(proposal.clone()),
                    });
                    actions.extend(Self::part_messages(self.height, round, parts));
                }
            }
        }
        for vote_type in [VoteType::Prevote, VoteType::Precommit] {
            if let Some(vote) = self
                .votes
                .vote_set(round, vote_type)
                .and_then(|set| set.get_by_address(&self.address))
            {
                actions.push(Action::Broadcast {
                    message: OutboundMessage::Vote(vote.clone()),
                });
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timeouts
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(level = "debug", skip_all, fields(timeout = %timeout))]
    fn on_timeout(&mut self, timeout: TimeoutInfo) -> Vec<Action> {
        if timeout.height != self.height
            || timeout.round < self.round
            || (timeout.round == self.round && timeout.step < self.step)
        {
            trace!(
                round = self.round,
                step = %self.step,
                "Ignoring stale timeout"
            );
            return vec![];
        }
        self.stats.timeouts_fired += 1;

        let (height, round) = (timeout.height, timeout.round);
        match timeout.step {
            RoundStep::NewHeight => self.enter_new_round(height, 0),
            RoundStep::NewRound => self.enter_propose(height, round),
            RoundStep::Propose => self.enter_prevote(height, round),
            RoundStep::PrevoteWait => self.enter_precommit(height, round),
            RoundStep::PrecommitWait => {
                let mut actions = self.enter_precommit(height, round);
                actions.extend(self.enter_new_round(height, round + 1));
                actions
            }
            RoundStep::Prevote | RoundStep::Precommit | RoundStep::Commit => {
                if timeout.step != self.step || round != self.round {
                    return vec![];
                }
                debug!(round, step = %self.step, "No progress, re-sending own messages");
                let vote_round = match self.step {
                    RoundStep::Commit => self.commit_round.unwrap_or(round),
                    _ => round,
                };
                let mut actions = self.rebroadcast_own(vote_round);
                actions.push(Action::ScheduleTimeout {
                    timeout: TimeoutInfo::new(timeout.duration, height, round, timeout.step)
                        .unconditional(),
                });
                actions
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event dispatch
    // ═══════════════════════════════════════════════════════════════════════

    fn is_member(&self, peer: &PeerId) -> bool {
        peer.is_local() || self.agent.has_peer_id(peer).is_ok()
    }

    /// Route an event for the current height.
    fn dispatch(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::TimeoutFired { timeout } => self.on_timeout(timeout),
            Event::ProposalReceived { proposal, peer } => self.on_proposal(proposal, &peer),
            Event::BlockPartReceived {
                height,
                header,
                part,
                peer,
                ..
            } => {
                if height != self.height {
                    return vec![];
                }
                self.on_block_part(header, part, &peer)
            }
            Event::VoteReceived { vote, peer } => self.try_add_vote(vote, &peer),
            Event::PeerMaj23Received {
                height,
                round,
                vote_type,
                block_id,
                peer,
            } => {
                if height != self.height {
                    return vec![];
                }
                match self.votes.set_peer_maj23(round, vote_type, peer.clone(), block_id) {
                    Ok(()) => vec![],
                    Err(e) => Self::penalize(&peer, e.to_string()),
                }
            }
            Event::PeerRemoved { peer } => {
                self.votes.remove_peer(&peer);
                self.helped.remove(&peer);
                vec![]
            }
        }
    }

    /// Jump forward when the chain has already moved past our height, e.g.
    /// after the node synced blocks it did not decide itself.
    fn catch_up_with_chain(&mut self) -> Vec<Action> {
        let chain_height = self.agent.get_last_block_height();
        if chain_height < self.height {
            return vec![];
        }
        info!(
            height = self.height,
            chain_height, "Chain is ahead of consensus, skipping forward"
        );
        self.committed_height = chain_height;
        let mut actions = self.update_to_height(chain_height + 1);
        if !self.finished {
            actions.extend(self.enter_new_round(chain_height + 1, 0));
        }
        actions
    }
}

impl StateMachine for ConsensusState {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        if !self.started || self.finished {
            return vec![];
        }
        if let Some(peer) = event.peer() {
            if !matches!(event, Event::PeerRemoved { .. }) && !self.is_member(peer) {
                trace!(peer = %peer, event = event.type_name(), "Dropping event from non-member");
                return vec![];
            }
        }

        if event.is_network() {
            if let Some(height) = event.height() {
                if height == self.height + 1 {
                    if self.future_events.len() < MAX_FUTURE_EVENTS {
                        self.future_events.push_back(event);
                    }
                    return vec![];
                }
                if height > self.height + 1 {
                    return self.catch_up_with_chain();
                }
            }
        }

        self.dispatch(event)
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

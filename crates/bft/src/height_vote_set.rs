//! Prevotes and precommits across every round of one height.

use crate::vote_set::{VoteSet, VoteSetError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tbft_types::{Address, BlockId, Hash, KeepBlockSign, PeerId, ValidatorSet, Vote, VoteType};
use tracing::debug;

/// Rounds beyond our own that a single peer may open.
const MAX_CATCHUP_ROUNDS_PER_PEER: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeightVoteSetError {
    /// The peer already used up its catch-up rounds.
    #[error("peer {peer} sent a vote for unwanted round {round}")]
    UnwantedRoundVote { peer: PeerId, round: u32 },

    #[error(transparent)]
    VoteSet(#[from] VoteSetError),
}

#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Vote sets for every round of a height.
///
/// Rounds `0..=round` always exist. Peers may open up to two further rounds
/// each so that votes from nodes ahead of us are not lost.
#[derive(Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: ValidatorSet,
    round: u32,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, [Option<u32>; MAX_CATCHUP_ROUNDS_PER_PEER]>,
}

impl HeightVoteSet {
    pub fn new(chain_id: impl Into<String>, height: u64, validators: ValidatorSet) -> Self {
        let mut hvs = Self {
            chain_id: chain_id.into(),
            height,
            validators: validators.clone(),
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        hvs.reset(height, validators);
        hvs
    }

    /// Drop every round and start over at round 0 of `height`.
    pub fn reset(&mut self, height: u64, validators: ValidatorSet) {
        self.height = height;
        self.validators = validators;
        self.round = 0;
        self.round_vote_sets.clear();
        self.peer_catchup_rounds.clear();
        self.add_round(0);
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Highest round created by [`set_round`](Self::set_round).
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Create vote sets for every round up to `round`.
    ///
    /// # Panics
    ///
    /// If `round` does not exceed the current round (other than the initial
    /// call at round 0).
    pub fn set_round(&mut self, round: u32) {
        if self.round != 0 && round <= self.round {
            panic!(
                "set_round must increase the round: current {}, requested {}",
                self.round, round
            );
        }
        for r in self.round + 1..=round {
            if !self.round_vote_sets.contains_key(&r) {
                self.add_round(r);
            }
        }
        self.round = round;
    }

    fn add_round(&mut self, round: u32) {
        let make = |vote_type| {
            VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                vote_type,
                self.validators.clone(),
            )
        };
        let sets = RoundVoteSet {
            prevotes: make(VoteType::Prevote),
            precommits: make(VoteType::Precommit),
        };
        self.round_vote_sets.insert(round, sets);
    }

    /// Add a vote received from `peer` (local votes use [`PeerId::local`]).
    ///
    /// A vote for a round we have not reached opens that round if the peer
    /// still has a free catch-up slot.
    pub fn add_vote(&mut self, vote: &Vote, peer: &PeerId) -> Result<bool, HeightVoteSetError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            let slots = self.peer_catchup_rounds.entry(peer.clone()).or_default();
            let Some(free) = slots.iter_mut().find(|s| s.is_none()) else {
                return Err(HeightVoteSetError::UnwantedRoundVote {
                    peer: peer.clone(),
                    round: vote.round,
                });
            };
            *free = Some(vote.round);
            debug!(
                height = self.height,
                round = vote.round,
                peer = %peer,
                "Opening catch-up round"
            );
            self.add_round(vote.round);
        }

        let Some(set) = self.vote_set_mut(vote.round, vote.vote_type) else {
            return Ok(false);
        };
        Ok(set.add_vote(vote)?)
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    pub fn vote_set(&self, round: u32, vote_type: VoteType) -> Option<&VoteSet> {
        let rvs = self.round_vote_sets.get(&round)?;
        Some(match vote_type {
            VoteType::Prevote => &rvs.prevotes,
            VoteType::Precommit => &rvs.precommits,
        })
    }

    fn vote_set_mut(&mut self, round: u32, vote_type: VoteType) -> Option<&mut VoteSet> {
        let rvs = self.round_vote_sets.get_mut(&round)?;
        Some(match vote_type {
            VoteType::Prevote => &mut rvs.prevotes,
            VoteType::Precommit => &mut rvs.precommits,
        })
    }

    /// Highest round up to the current one with a prevote majority, and the
    /// block id it went to.
    pub fn pol_info(&self) -> Option<(u32, BlockId)> {
        (0..=self.round).rev().find_map(|r| {
            self.prevotes(r)
                .and_then(VoteSet::two_thirds_majority)
                .map(|block_id| (r, block_id))
        })
    }

    /// Record a peer's +2/3 claim. Claims for unknown rounds are ignored.
    pub fn set_peer_maj23(
        &mut self,
        round: u32,
        vote_type: VoteType,
        peer: PeerId,
        block_id: BlockId,
    ) -> Result<(), VoteSetError> {
        match self.vote_set_mut(round, vote_type) {
            Some(set) => set.set_peer_maj23(peer, block_id),
            None => Ok(()),
        }
    }

    /// Find the verdict `address` attached to a prevote for `hash`, scanning
    /// from `round` down to round 0.
    pub fn get_signs_from_vote(
        &self,
        round: u32,
        hash: &Hash,
        address: &Address,
    ) -> Option<KeepBlockSign> {
        (0..=round).rev().find_map(|r| {
            self.prevotes(r)
                .and_then(|set| set.get_sign_by_address(address))
                .filter(|sign| sign.hash == *hash)
        })
    }

    /// Forget catch-up bookkeeping for a disconnected peer.
    ///
    /// Rounds it opened stay; only its slots are released.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peer_catchup_rounds.remove(peer);
    }
}

impl fmt::Display for HeightVoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HeightVoteSet{{H:{} R:{}", self.height, self.round)?;
        for rvs in self.round_vote_sets.values() {
            writeln!(f, "  {}", rvs.prevotes)?;
            writeln!(f, "  {}", rvs.precommits)?;
        }
        write!(f, "}}")
    }
}

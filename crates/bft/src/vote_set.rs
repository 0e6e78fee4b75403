//! Vote aggregation for one height, round and vote type.

use std::collections::HashMap;
use std::fmt;
use tbft_types::{
    Address, BitArray, BlockId, KeepBlockSign, PeerId, ValidatorSet, Vote, VoteError, VoteType,
};
use tracing::trace;

/// Errors adding a vote or a peer claim to a [`VoteSet`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteSetError {
    #[error("vote for {height}/{round}/{vote_type} does not belong to this vote set")]
    UnexpectedStep {
        height: u64,
        round: u32,
        vote_type: VoteType,
    },

    #[error("validator index {0} out of range")]
    InvalidValidatorIndex(u32),

    #[error("validator index {index} belongs to {expected}, vote claims {actual}")]
    ValidatorAddressMismatch {
        index: u32,
        expected: Address,
        actual: Address,
    },

    #[error(transparent)]
    InvalidVote(#[from] VoteError),

    /// The validator already voted for a different block in this set.
    #[error("conflicting vote from {}: {} vs {}", existing.validator_address, existing.block_id, conflicting.block_id)]
    ConflictingVote {
        existing: Box<Vote>,
        conflicting: Box<Vote>,
    },

    #[error("peer {peer} already claimed +2/3 for {existing}, now claims {claimed}")]
    ConflictingPeerMaj23 {
        peer: PeerId,
        existing: BlockId,
        claimed: BlockId,
    },
}

impl VoteSetError {
    /// Whether the error proves the vote's author or sender misbehaved.
    pub fn is_equivocation(&self) -> bool {
        matches!(self, VoteSetError::ConflictingVote { .. })
    }
}

#[derive(Debug, Clone)]
struct BlockVotes {
    bit_array: BitArray,
    sum: u64,
}

impl BlockVotes {
    fn new(len: usize) -> Self {
        Self {
            bit_array: BitArray::new(len),
            sum: 0,
        }
    }
}

/// Votes of one type for one height and round.
///
/// Each validator contributes at most one vote. Once some block id gathers
/// more than two thirds of the voting power it is cached as the majority and
/// never changes.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: ValidatorSet,

    votes: Vec<Option<Vote>>,
    votes_bit_array: BitArray,
    sum: u64,
    maj23: Option<BlockId>,
    votes_by_block: HashMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<PeerId, BlockId>,
}

impl VoteSet {
    pub fn new(
        chain_id: impl Into<String>,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        let len = validators.len();
        Self {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; len],
            votes_bit_array: BitArray::new(len),
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    /// Add a vote.
    ///
    /// Returns `Ok(false)` for a vote identical in block id to one already
    /// held. A vote for a different block id from the same validator is
    /// rejected with [`VoteSetError::ConflictingVote`] and leaves the set
    /// untouched.
    pub fn add_vote(&mut self, vote: &Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height
            || vote.round != self.round
            || vote.vote_type != self.vote_type
        {
            return Err(VoteSetError::UnexpectedStep {
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
            });
        }

        let index = vote.validator_index;
        let validator = self
            .validators
            .get_by_index(index)
            .ok_or(VoteSetError::InvalidValidatorIndex(index))?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::ValidatorAddressMismatch {
                index,
                expected: validator.address,
                actual: vote.validator_address,
            });
        }
        let power = validator.voting_power;
        let public_key = validator.public_key;

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id {
                return Ok(false);
            }
        }

        vote.verify(&self.chain_id, &public_key)?;

        if let Some(existing) = &self.votes[index as usize] {
            return Err(VoteSetError::ConflictingVote {
                existing: Box::new(existing.clone()),
                conflicting: Box::new(vote.clone()),
            });
        }

        self.votes[index as usize] = Some(vote.clone());
        self.votes_bit_array.set(index as usize, true);
        self.sum += power;

        let len = self.validators.len();
        let tally = self
            .votes_by_block
            .entry(vote.block_id)
            .or_insert_with(|| BlockVotes::new(len));
        tally.bit_array.set(index as usize, true);
        tally.sum += power;

        if self.maj23.is_none() && self.validators.has_two_thirds(tally.sum) {
            trace!(
                height = self.height,
                round = self.round,
                vote_type = %self.vote_type,
                block_id = %vote.block_id,
                "+2/3 majority reached"
            );
            self.maj23 = Some(vote.block_id);
        }

        Ok(true)
    }

    /// Record that `peer` claims +2/3 for `block_id`.
    ///
    /// A peer may only ever claim one block id per vote set.
    pub fn set_peer_maj23(&mut self, peer: PeerId, block_id: BlockId) -> Result<(), VoteSetError> {
        match self.peer_maj23s.get(&peer) {
            Some(existing) if *existing == block_id => Ok(()),
            Some(existing) => Err(VoteSetError::ConflictingPeerMaj23 {
                peer,
                existing: *existing,
                claimed: block_id,
            }),
            None => {
                self.peer_maj23s.insert(peer, block_id);
                Ok(())
            }
        }
    }

    /// Block id that gathered +2/3, if any. Nil is a valid majority.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Whether +2/3 of the voting power voted, for anything.
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.has_two_thirds(self.sum)
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(Option::as_ref)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.get_by_index(index)
    }

    /// The chain agent's verdict carried by `address`'s vote, if it voted for
    /// a block.
    pub fn get_sign_by_address(&self, address: &Address) -> Option<KeepBlockSign> {
        self.get_by_address(address)?.keep_block_sign()
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.votes_bit_array
    }

    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<&BitArray> {
        self.votes_by_block.get(block_id).map(|t| &t.bit_array)
    }

    /// All votes held, in validator order.
    pub fn iter(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }
}

impl fmt::Display for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VoteSet{{H:{} R:{} T:{} {} maj23:{}}}",
            self.height,
            self.round,
            self.vote_type,
            self.votes_bit_array,
            self.maj23
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbft_types::test_utils::{signed_vote, test_block_id, test_keys, test_validator_set};
    use tbft_types::KeyPair;

    const CHAIN: &str = "test-chain";

    fn setup(n: usize) -> (Vec<KeyPair>, VoteSet) {
        let keys = test_keys(n);
        let vals = test_validator_set(&keys);
        (keys, VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, vals))
    }

    fn vote(keys: &[KeyPair], set: &VoteSet, i: usize, block_id: BlockId) -> Vote {
        let (index, _) = set.validators.get_by_address(&keys[i].address()).unwrap();
        signed_vote(CHAIN, &keys[i], index, 1, 0, VoteType::Prevote, block_id)
    }

    #[test]
    fn test_majority_is_monotonic() {
        let (keys, mut set) = setup(4);
        let a = test_block_id(b"a");

        for i in 0..2 {
            assert!(set.add_vote(&vote(&keys, &set, i, a)).unwrap());
            assert!(!set.has_two_thirds_majority());
        }
        assert!(set.add_vote(&vote(&keys, &set, 2, a)).unwrap());
        assert_eq!(set.two_thirds_majority(), Some(a));

        // A late nil vote does not move the majority.
        assert!(set.add_vote(&vote(&keys, &set, 3, BlockId::nil())).unwrap());
        assert_eq!(set.two_thirds_majority(), Some(a));
        assert!(set.has_all());
    }

    #[test]
    fn test_duplicate_vote_is_idempotent() {
        let (keys, mut set) = setup(4);
        let a = test_block_id(b"a");
        let v = vote(&keys, &set, 0, a);

        assert!(set.add_vote(&v).unwrap());
        assert!(!set.add_vote(&v).unwrap());
        assert_eq!(set.bit_array().count_ones(), 1);
        assert!(!set.has_two_thirds_any());
    }

    #[test]
    fn test_equivocation_is_rejected_and_state_untouched() {
        let (keys, mut set) = setup(4);
        let a = test_block_id(b"a");
        let b = test_block_id(b"b");
        let first = vote(&keys, &set, 0, a);
        let second = vote(&keys, &set, 0, b);

        set.add_vote(&first).unwrap();
        let err = set.add_vote(&second).unwrap_err();
        assert!(err.is_equivocation());
        assert_eq!(set.get_by_index(first.validator_index), Some(&first));
        assert!(set.bit_array_by_block_id(&b).is_none());
        assert_eq!(set.bit_array().count_ones(), 1);
    }

    #[test]
    fn test_rejects_bad_votes() {
        let (keys, mut set) = setup(4);
        let a = test_block_id(b"a");

        let wrong_round = signed_vote(CHAIN, &keys[0], 0, 1, 1, VoteType::Prevote, a);
        assert!(matches!(
            set.add_vote(&wrong_round),
            Err(VoteSetError::UnexpectedStep { .. })
        ));

        let bad_index = signed_vote(CHAIN, &keys[0], 9, 1, 0, VoteType::Prevote, a);
        assert_eq!(
            set.add_vote(&bad_index),
            Err(VoteSetError::InvalidValidatorIndex(9))
        );

        let mut forged = vote(&keys, &set, 1, a);
        forged.timestamp_ms += 1;
        assert!(matches!(
            set.add_vote(&forged),
            Err(VoteSetError::InvalidVote(VoteError::InvalidSignature(_)))
        ));

        let (index, _) = set.validators.get_by_address(&keys[0].address()).unwrap();
        let other_index = (index + 1) % 4;
        let misplaced = signed_vote(CHAIN, &keys[0], other_index, 1, 0, VoteType::Prevote, a);
        assert!(matches!(
            set.add_vote(&misplaced),
            Err(VoteSetError::ValidatorAddressMismatch { .. })
        ));
        assert_eq!(set.bit_array().count_ones(), 0);
    }

    #[test]
    fn test_two_thirds_any_without_majority() {
        let (keys, mut set) = setup(4);
        set.add_vote(&vote(&keys, &set, 0, test_block_id(b"a")))
            .unwrap();
        set.add_vote(&vote(&keys, &set, 1, test_block_id(b"b")))
            .unwrap();
        set.add_vote(&vote(&keys, &set, 2, BlockId::nil())).unwrap();
        assert!(set.has_two_thirds_any());
        assert!(!set.has_two_thirds_majority());
    }

    #[test]
    fn test_peer_maj23_claims() {
        let (_, mut set) = setup(4);
        let peer = PeerId::from("peer");
        let a = test_block_id(b"a");
        set.set_peer_maj23(peer.clone(), a).unwrap();
        set.set_peer_maj23(peer.clone(), a).unwrap();
        assert!(matches!(
            set.set_peer_maj23(peer, test_block_id(b"b")),
            Err(VoteSetError::ConflictingPeerMaj23 { .. })
        ));
    }

    #[test]
    fn test_sign_by_address() {
        let (keys, mut set) = setup(4);
        let a = test_block_id(b"a");
        let sign = KeepBlockSign {
            result: tbft_types::SignResult::Agree,
            signature: vec![7; 4],
            hash: a.hash,
        };
        let v = vote(&keys, &set, 0, a).with_block_sign(&sign);
        set.add_vote(&v).unwrap();
        assert_eq!(set.get_sign_by_address(&keys[0].address()), Some(sign));
        assert_eq!(set.get_sign_by_address(&keys[1].address()), None);
    }
}

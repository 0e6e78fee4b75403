//! Core types for TBFT consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, ed25519 keys and signatures, addresses
//! - **Consensus messages**: Vote, Proposal, BlockId, canonical sign bytes
//! - **Committees**: Validator, ValidatorSet with proposer rotation, committee
//!   membership input
//! - **Block transport**: Block, PartSet, BitArray
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod crypto;
mod hash;
mod identifiers;
mod signing;

mod bit_array;
mod block;
mod committee;
mod part_set;
mod proposal;
mod validator;
mod vote;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use identifiers::{Address, PeerId, VoteType};
pub use signing::{
    differ_only_by_timestamp, proposal_sign_bytes, sign_bytes_timestamp, vote_sign_bytes,
    DOMAIN_PROPOSAL, DOMAIN_VOTE, TIMESTAMP_LEN,
};

pub use bit_array::BitArray;
pub use block::{
    block_from_part_set, make_part_set, Block, BlockCodecError, BlockSign, KeepBlockSign,
    SignResult, MAX_BLOCK_BYTES,
};
pub use committee::{
    CommitteeInfo, CommitteeMember, CommitteeNode, MemberFlag, MemberType, MEMBER_VOTING_POWER,
};
pub use part_set::{max_parts, Part, PartSet, PartSetError, BLOCK_PART_SIZE_BYTES};
pub use proposal::{Proposal, ProposalError};
pub use validator::{Validator, ValidatorSet, ValidatorSetError};
pub use vote::{BlockId, PartSetHeader, Vote, VoteError};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic key for validator `seed`.
    pub fn test_key(seed: u8) -> KeyPair {
        KeyPair::from_seed([seed.wrapping_add(1); 32])
    }

    /// `n` deterministic keys.
    pub fn test_keys(n: usize) -> Vec<KeyPair> {
        (0..n).map(|i| test_key(i as u8)).collect()
    }

    /// Equal-power validator set for the given keys, in key order.
    pub fn test_validator_set(keys: &[KeyPair]) -> ValidatorSet {
        let validators = keys
            .iter()
            .map(|k| Validator::new(k.public_key(), 1))
            .collect();
        ValidatorSet::new(validators).expect("non-empty distinct keys")
    }

    /// Committee of used, elected members for the given keys.
    pub fn test_committee(id: u64, start_height: u64, keys: &[KeyPair]) -> CommitteeInfo {
        CommitteeInfo {
            id,
            start_height,
            end_height: 0,
            members: keys
                .iter()
                .map(|k| CommitteeMember::new(k.public_key(), MemberFlag::Used, MemberType::Worked))
                .collect(),
            back_members: Vec::new(),
        }
    }

    /// Block with a payload derived from `seed`.
    pub fn test_block(height: u64, proposer: Address, seed: u8) -> Block {
        Block::new(height, Hash::from_bytes(&[seed]), proposer, height * 1000, vec![seed; 64])
    }

    /// A vote signed by `key`.
    #[allow(clippy::too_many_arguments)]
    pub fn signed_vote(
        chain_id: &str,
        key: &KeyPair,
        index: u32,
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> Vote {
        let mut vote = Vote::new(key.address(), index, height, round, 0, vote_type, block_id);
        vote.signature = key.sign(&vote.sign_bytes(chain_id));
        vote
    }

    /// Non-nil block id derived from `seed`.
    pub fn test_block_id(seed: &[u8]) -> BlockId {
        let hash = Hash::from_bytes(seed);
        BlockId::new(hash, PartSetHeader::new(1, hash))
    }
}

//! Votes and the block identifiers they refer to.

use crate::{
    vote_sign_bytes, Address, Hash, KeepBlockSign, PublicKey, SignResult, Signature, VoteType,
};
use sbor::prelude::BasicSbor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors validating a single vote against its claimed signer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    #[error("vote address {actual} does not match validator {expected}")]
    InvalidValidatorAddress { expected: Address, actual: Address },

    #[error("invalid vote signature from {0}")]
    InvalidSignature(Address),
}

/// Header describing how a block was split into parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor, Serialize, Deserialize)]
pub struct PartSetHeader {
    /// Number of parts.
    pub total: u32,
    /// Hash of the reassembled payload.
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn new(total: u32, hash: Hash) -> Self {
        Self { total, hash }
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.total, self.hash.short())
    }
}

/// Identifies a candidate block: its hash plus its part-set header.
///
/// The zero value means "nil".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts: PartSetHeader,
}

impl BlockId {
    pub fn new(hash: Hash, parts: PartSetHeader) -> Self {
        Self { hash, parts }
    }

    /// The nil block id.
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.parts.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else {
            write!(f, "{}:{}", self.hash.short(), self.parts)
        }
    }
}

/// A signed prevote or precommit.
///
/// Block votes also carry the chain agent's verification result for the
/// block (`result` / `result_signature`); these are not covered by the vote
/// signature.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Vote {
    pub validator_address: Address,
    /// Position of the validator in the height's validator set.
    pub validator_index: u32,
    pub height: u64,
    pub round: u32,
    /// Milliseconds since the unix epoch.
    pub timestamp_ms: u64,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub signature: Signature,
    pub result: SignResult,
    pub result_signature: Vec<u8>,
}

impl Vote {
    /// Create an unsigned vote.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        validator_address: Address,
        validator_index: u32,
        height: u64,
        round: u32,
        timestamp_ms: u64,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> Self {
        Self {
            validator_address,
            validator_index,
            height,
            round,
            timestamp_ms,
            vote_type,
            block_id,
            signature: Signature::zero(),
            result: SignResult::default(),
            result_signature: Vec::new(),
        }
    }

    /// Attach the chain agent's verification result.
    pub fn with_block_sign(mut self, sign: &KeepBlockSign) -> Self {
        self.result = sign.result;
        self.result_signature = sign.signature.clone();
        self
    }

    /// Canonical bytes covered by `signature`.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        vote_sign_bytes(
            chain_id,
            self.height,
            self.round,
            self.vote_type,
            &self.block_id,
            self.timestamp_ms,
        )
    }

    /// Check that `public_key` owns this vote and signed it.
    pub fn verify(&self, chain_id: &str, public_key: &PublicKey) -> Result<(), VoteError> {
        let expected = public_key.address();
        if expected != self.validator_address {
            return Err(VoteError::InvalidValidatorAddress {
                expected,
                actual: self.validator_address,
            });
        }
        if !public_key.verify(&self.sign_bytes(chain_id), &self.signature) {
            return Err(VoteError::InvalidSignature(self.validator_address));
        }
        Ok(())
    }

    /// The chain agent's sign carried by a block vote, if any.
    pub fn keep_block_sign(&self) -> Option<KeepBlockSign> {
        if self.block_id.is_nil() {
            return None;
        }
        Some(KeepBlockSign {
            result: self.result,
            signature: self.result_signature.clone(),
            hash: self.block_id.hash,
        })
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{}:{} {}/{} {} {} @{}}}",
            self.validator_index,
            self.validator_address,
            self.height,
            self.round,
            self.vote_type,
            self.block_id,
            self.timestamp_ms
        )
    }
}

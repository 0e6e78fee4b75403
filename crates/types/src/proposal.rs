//! Block proposals.

use crate::{proposal_sign_bytes, BlockId, PartSetHeader, PublicKey, Signature};
use sbor::prelude::BasicSbor;
use std::fmt;

/// Errors validating a received proposal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    #[error("proof-of-lock round {pol_round} is not below proposal round {round}")]
    InvalidPolRound { pol_round: u32, round: u32 },

    #[error("invalid proposal signature")]
    InvalidSignature,
}

/// A block proposal for a height and round.
///
/// Refers to the block only through its part-set header. May re-propose a
/// block locked in an earlier round, named by `pol_round` / `pol_block_id`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub timestamp_ms: u64,
    pub block_parts: PartSetHeader,
    pub pol_round: Option<u32>,
    pub pol_block_id: BlockId,
    pub signature: Signature,
}

impl Proposal {
    /// Create an unsigned proposal.
    pub fn new(
        height: u64,
        round: u32,
        timestamp_ms: u64,
        block_parts: PartSetHeader,
        pol_round: Option<u32>,
        pol_block_id: BlockId,
    ) -> Self {
        Self {
            height,
            round,
            timestamp_ms,
            block_parts,
            pol_round,
            pol_block_id,
            signature: Signature::zero(),
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        proposal_sign_bytes(
            chain_id,
            self.height,
            self.round,
            &self.block_parts,
            self.pol_round,
            &self.pol_block_id,
            self.timestamp_ms,
        )
    }

    /// Check the POL round and the proposer's signature.
    pub fn verify(&self, chain_id: &str, proposer: &PublicKey) -> Result<(), ProposalError> {
        if let Some(pol_round) = self.pol_round {
            if pol_round >= self.round {
                return Err(ProposalError::InvalidPolRound {
                    pol_round,
                    round: self.round,
                });
            }
        }
        if !proposer.verify(&self.sign_bytes(chain_id), &self.signature) {
            return Err(ProposalError::InvalidSignature);
        }
        Ok(())
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pol = match self.pol_round {
            Some(r) => r.to_string(),
            None => "-".to_string(),
        };
        write!(
            f,
            "Proposal{{{}/{} {} ({},{}) @{}}}",
            self.height, self.round, self.block_parts, pol, self.pol_block_id, self.timestamp_ms
        )
    }
}

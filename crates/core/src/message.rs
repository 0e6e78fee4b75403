//! Outbound message types for network communication.

use sbor::prelude::BasicSbor;
use tbft_types::{BlockId, Part, PartSetHeader, Proposal, Vote, VoteType};

/// Outbound network messages.
///
/// These are the messages that a node broadcasts to the rest of its
/// committee. The runner handles the actual network I/O.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum OutboundMessage {
    /// Signed block proposal for a height/round.
    Proposal(Proposal),

    /// One part of the proposed block, tagged with the header of the part
    /// set it belongs to.
    BlockPart {
        height: u64,
        round: u32,
        header: PartSetHeader,
        part: Part,
    },

    /// Signed prevote or precommit.
    Vote(Vote),

    /// Claim that the sender has seen +2/3 votes for `block_id`.
    VoteSetMaj23 {
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: BlockId,
    },
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Proposal(_) => "Proposal",
            OutboundMessage::BlockPart { .. } => "BlockPart",
            OutboundMessage::Vote(_) => "Vote",
            OutboundMessage::VoteSetMaj23 { .. } => "VoteSetMaj23",
        }
    }

    /// Height the message refers to.
    pub fn height(&self) -> u64 {
        match self {
            OutboundMessage::Proposal(p) => p.height,
            OutboundMessage::BlockPart { height, .. } => *height,
            OutboundMessage::Vote(v) => v.height,
            OutboundMessage::VoteSetMaj23 { height, .. } => *height,
        }
    }

    pub fn is_vote(&self) -> bool {
        matches!(self, OutboundMessage::Vote(_))
    }
}

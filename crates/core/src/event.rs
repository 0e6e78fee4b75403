//! Event types for the deterministic state machine.

use crate::{OutboundMessage, TimeoutInfo};
use tbft_types::{BlockId, Part, PartSetHeader, PeerId, Proposal, Vote, VoteType};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: bookkeeping signalled by the runner itself.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,
}

/// All possible events a consensus node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
///
/// `peer` is the transport id of the sender; `PeerId::local()` for
/// messages the node generated itself.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// A scheduled round-step timeout fired.
    TimeoutFired { timeout: TimeoutInfo },

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// Received a block proposal.
    ProposalReceived { proposal: Proposal, peer: PeerId },

    /// Received one part of a proposed block.
    BlockPartReceived {
        height: u64,
        round: u32,
        header: PartSetHeader,
        part: Part,
        peer: PeerId,
    },

    /// Received a prevote or precommit.
    VoteReceived { vote: Vote, peer: PeerId },

    /// A peer claims +2/3 for a block id.
    PeerMaj23Received {
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: BlockId,
        peer: PeerId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// The transport dropped a peer; per-peer bookkeeping can be released.
    PeerRemoved { peer: PeerId },
}

impl Event {
    /// Wrap a message received from `peer`.
    pub fn from_message(message: OutboundMessage, peer: PeerId) -> Self {
        match message {
            OutboundMessage::Proposal(proposal) => Event::ProposalReceived { proposal, peer },
            OutboundMessage::BlockPart {
                height,
                round,
                header,
                part,
            } => Event::BlockPartReceived {
                height,
                round,
                header,
                part,
                peer,
            },
            OutboundMessage::Vote(vote) => Event::VoteReceived { vote, peer },
            OutboundMessage::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => Event::PeerMaj23Received {
                height,
                round,
                vote_type,
                block_id,
                peer,
            },
        }
    }

    /// Height the event refers to, if any.
    pub fn height(&self) -> Option<u64> {
        match self {
            Event::TimeoutFired { timeout } => Some(timeout.height),
            Event::ProposalReceived { proposal, .. } => Some(proposal.height),
            Event::BlockPartReceived { height, .. } => Some(*height),
            Event::VoteReceived { vote, .. } => Some(vote.height),
            Event::PeerMaj23Received { height, .. } => Some(*height),
            Event::PeerRemoved { .. } => None,
        }
    }

    /// Sending peer of a network event.
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Event::ProposalReceived { peer, .. }
            | Event::BlockPartReceived { peer, .. }
            | Event::VoteReceived { peer, .. }
            | Event::PeerMaj23Received { peer, .. }
            | Event::PeerRemoved { peer } => Some(peer),
            Event::TimeoutFired { .. } => None,
        }
    }

    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::PeerRemoved { .. } => EventPriority::Internal,
            Event::TimeoutFired { .. } => EventPriority::Timer,
            Event::ProposalReceived { .. }
            | Event::BlockPartReceived { .. }
            | Event::VoteReceived { .. }
            | Event::PeerMaj23Received { .. } => EventPriority::Network,
        }
    }

    /// Check if this is a network event (from another node).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::TimeoutFired { .. } => "TimeoutFired",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::BlockPartReceived { .. } => "BlockPartReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::PeerMaj23Received { .. } => "PeerMaj23Received",
            Event::PeerRemoved { .. } => "PeerRemoved",
        }
    }
}

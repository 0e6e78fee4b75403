//! Action types for the deterministic state machine.

use crate::{OutboundMessage, TimeoutInfo};
use tbft_types::{Hash, PeerId};

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every committee peer.
    Broadcast { message: OutboundMessage },

    /// Send a message to a single peer.
    SendTo { peer: PeerId, message: OutboundMessage },

    /// Report a misbehaving peer to the transport.
    PenalizePeer { peer: PeerId, reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Ask the ticker to arm a round-step timeout.
    ScheduleTimeout { timeout: TimeoutInfo },

    // ═══════════════════════════════════════════════════════════════════════
    // Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// A block was finalized and handed to the chain agent.
    BlockCommitted {
        height: u64,
        round: u32,
        block_hash: Hash,
    },
}

impl Action {
    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendTo { .. } => "SendTo",
            Action::PenalizePeer { .. } => "PenalizePeer",
            Action::ScheduleTimeout { .. } => "ScheduleTimeout",
            Action::BlockCommitted { .. } => "BlockCommitted",
        }
    }
}

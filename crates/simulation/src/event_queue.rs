//! Ordering key for the global event queue.

use crate::NodeIndex;
use std::time::Duration;
use tbft_core::{Event, EventPriority};

/// Events sort by time, then priority, then node, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node_index,
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbft_core::{RoundStep, TimeoutInfo};
    use tbft_types::PeerId;

    #[test]
    fn test_timers_run_before_network_at_same_time() {
        let timeout = Event::TimeoutFired {
            timeout: TimeoutInfo::new(Duration::ZERO, 1, 0, RoundStep::Propose),
        };
        let removed = Event::PeerRemoved {
            peer: PeerId::from("p"),
        };
        let at = Duration::from_millis(5);

        let timer_key = EventKey::new(at, &timeout, 3, 10);
        let internal_key = EventKey::new(at, &removed, 3, 11);
        let earlier = EventKey::new(Duration::from_millis(4), &timeout, 9, 12);

        assert!(internal_key < timer_key);
        assert!(earlier < internal_key);
    }
}

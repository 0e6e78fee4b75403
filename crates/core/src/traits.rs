//! State machine trait.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// The runner owns time: it calls `set_time` before each `handle` so the
/// machine never reads a clock itself.
pub trait StateMachine {
    /// Process one event and return the resulting actions.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Update the machine's notion of the current time.
    fn set_time(&mut self, now: Duration);

    /// The time last passed to `set_time`.
    fn now(&self) -> Duration;
}

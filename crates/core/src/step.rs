//! Round steps and timeout descriptors.

use sbor::prelude::BasicSbor;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Position within a round.
///
/// Ordered so that later steps compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStep {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl RoundStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStep::NewHeight => "new_height",
            RoundStep::NewRound => "new_round",
            RoundStep::Propose => "propose",
            RoundStep::Prevote => "prevote",
            RoundStep::PrevoteWait => "prevote_wait",
            RoundStep::Precommit => "precommit",
            RoundStep::PrecommitWait => "precommit_wait",
            RoundStep::Commit => "commit",
        }
    }
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timeout request for a height/round/step.
///
/// With `wait` set the request is only honored if it is newer than the last
/// one the ticker accepted; without it the ticker re-arms unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    pub wait: bool,
}

impl TimeoutInfo {
    pub fn new(duration: Duration, height: u64, round: u32, step: RoundStep) -> Self {
        Self {
            duration,
            height,
            round,
            step,
            wait: true,
        }
    }

    /// Request that re-arms regardless of what is pending.
    pub fn unconditional(mut self) -> Self {
        self.wait = false;
        self
    }

    pub fn hrs(&self) -> (u64, u32, RoundStep) {
        (self.height, self.round, self.step)
    }

    /// Whether this request should replace `last`, the most recently
    /// accepted one.
    pub fn supersedes(&self, last: Option<&TimeoutInfo>) -> bool {
        match last {
            None => true,
            Some(_) if !self.wait => true,
            Some(last) => self.hrs() > last.hrs(),
        }
    }
}

impl fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}/{}/{}",
            self.duration, self.height, self.round, self.step
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ti(height: u64, round: u32, step: RoundStep) -> TimeoutInfo {
        TimeoutInfo::new(Duration::from_millis(10), height, round, step)
    }

    #[test]
    fn test_supersedes_is_lexicographic() {
        let last = ti(5, 1, RoundStep::Prevote);
        assert!(ti(5, 1, RoundStep::PrevoteWait).supersedes(Some(&last)));
        assert!(ti(5, 2, RoundStep::Propose).supersedes(Some(&last)));
        assert!(ti(6, 0, RoundStep::NewHeight).supersedes(Some(&last)));
        assert!(!ti(5, 1, RoundStep::Prevote).supersedes(Some(&last)));
        assert!(!ti(5, 1, RoundStep::Propose).supersedes(Some(&last)));
        assert!(!ti(4, 9, RoundStep::Commit).supersedes(Some(&last)));
    }

    #[test]
    fn test_unconditional_always_supersedes() {
        let last = ti(5, 1, RoundStep::Prevote);
        assert!(ti(1, 0, RoundStep::Propose).unconditional().supersedes(Some(&last)));
        assert!(ti(1, 0, RoundStep::Propose).supersedes(None));
    }
}

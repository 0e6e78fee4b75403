//! Start/stop state shared by long-lived workers.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ServiceState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::Idle,
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{name} cannot start from state {state}")]
    CannotStart {
        name: &'static str,
        state: ServiceState,
    },

    #[error("{name} failed to start: {reason}")]
    StartFailed { name: &'static str, reason: String },
}

/// Atomic lifecycle state machine.
///
/// Transitions: `Idle → Starting → Running → Stopping → Stopped`. Starting is
/// allowed once; stopping is idempotent and may be requested from any state.
#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(ServiceState::Idle as u8),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// `Idle → Starting`. Fails from any other state.
    pub fn begin_start(&self) -> Result<(), ServiceError> {
        self.state
            .compare_exchange(
                ServiceState::Idle as u8,
                ServiceState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| debug!(service = self.name, "starting"))
            .map_err(|current| ServiceError::CannotStart {
                name: self.name,
                state: ServiceState::from_u8(current),
            })
    }

    /// `Starting → Running`. A stop requested meanwhile wins.
    pub fn mark_running(&self) {
        if self
            .state
            .compare_exchange(
                ServiceState::Starting as u8,
                ServiceState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(service = self.name, "running");
        }
    }

    /// Move to `Stopping`.
    ///
    /// Returns true for the single caller that performed the transition, false
    /// if the worker was already stopping or stopped. A worker that never
    /// started goes straight to `Stopped`.
    pub fn begin_stop(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match ServiceState::from_u8(current) {
                ServiceState::Idle => ServiceState::Stopped,
                ServiceState::Starting | ServiceState::Running => ServiceState::Stopping,
                ServiceState::Stopping | ServiceState::Stopped => return false,
            };
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(service = self.name, state = %next, "stopping");
                    return next == ServiceState::Stopping;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Final transition to `Stopped`.
    pub fn mark_stopped(&self) {
        self.state
            .store(ServiceState::Stopped as u8, Ordering::Release);
        debug!(service = self.name, "stopped");
    }
}

/// A long-lived worker with explicit start and stop.
pub trait Service {
    /// Start the worker. Fails if it was already started.
    fn start(&mut self) -> Result<(), ServiceError>;

    /// Stop the worker. Idempotent.
    fn stop(&mut self);

    fn state(&self) -> ServiceState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle() {
        let lc = Lifecycle::new("worker");
        assert_eq!(lc.state(), ServiceState::Idle);
        lc.begin_start().unwrap();
        lc.mark_running();
        assert!(lc.is_running());
        assert!(lc.begin_stop());
        assert_eq!(lc.state(), ServiceState::Stopping);
        lc.mark_stopped();
        assert_eq!(lc.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_start_only_once() {
        let lc = Lifecycle::new("worker");
        lc.begin_start().unwrap();
        assert_eq!(
            lc.begin_start(),
            Err(ServiceError::CannotStart {
                name: "worker",
                state: ServiceState::Starting
            })
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let lc = Lifecycle::new("worker");
        lc.begin_start().unwrap();
        lc.mark_running();
        assert!(lc.begin_stop());
        assert!(!lc.begin_stop());
        lc.mark_stopped();
        assert!(!lc.begin_stop());
        assert!(lc.begin_start().is_err());
    }

    #[test]
    fn test_stop_before_start() {
        let lc = Lifecycle::new("worker");
        assert!(!lc.begin_stop());
        assert_eq!(lc.state(), ServiceState::Stopped);
    }

    #[test]
    fn test_stop_during_start_wins() {
        let lc = Lifecycle::new("worker");
        lc.begin_start().unwrap();
        assert!(lc.begin_stop());
        lc.mark_running();
        assert_eq!(lc.state(), ServiceState::Stopping);
    }
}

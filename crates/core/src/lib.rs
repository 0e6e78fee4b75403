//! Core types for TBFT consensus.
//!
//! This crate provides the foundational types for the consensus architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`TimeoutInfo`] / [`RoundStep`]: Round-step timeouts
//! - [`StateMachine`]: The trait that the consensus state machine implements
//! - [`Lifecycle`] / [`Service`]: Start/stop state of long-lived workers
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, performs no network I/O
//!
//! All network I/O and timers are handled by the runner (simulation or
//! production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts fired timeouts and received messages back into events

mod action;
mod event;
mod lifecycle;
mod message;
mod step;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use lifecycle::{Lifecycle, Service, ServiceError, ServiceState};
pub use message::OutboundMessage;
pub use step::{RoundStep, TimeoutInfo};
pub use traits::StateMachine;

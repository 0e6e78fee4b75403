//! Deterministic simulation of a tbft committee.
//!
//! Every validator runs the real [`ConsensusState`](tbft_bft::ConsensusState)
//! against its own in-memory [`SimChain`]. A single global event queue,
//! ordered by simulated time, replaces the tokio runtime: the same seed always
//! yields the same run.
//!
//! - [`SimulatedNetwork`]: latency with jitter, packet loss and partitions
//! - [`SimulationRunner`]: event queue, ticker emulation, message routing

mod chain;
mod event_queue;
mod network;
mod runner;

pub use chain::SimChain;
pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};

/// Position of a validator in the simulated committee.
pub type NodeIndex = u32;

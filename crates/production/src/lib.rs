//! Production runtime for tbft committees.
//!
//! This crate wraps the deterministic [`ConsensusState`](tbft_bft::ConsensusState)
//! with real async I/O:
//!
//! - Round timeouts via the tokio [`TimeoutTicker`]
//! - Inbound events and outbound transport commands via bounded channels
//! - Committee lifecycle via the [`Node`] registry
//!
//! # Architecture
//!
//! Each running committee is one task owning its state machine. Nothing else
//! touches the state, so there is no lock on the consensus path.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                               Node                                 │
//! │   put_committee / notify / update_committee / deliver              │
//! │                                │                                   │
//! │        ┌───────────────────────┴──────────────────────┐            │
//! │        ▼                                              ▼            │
//! │  ConsensusRunner (committee N)            ConsensusRunner (N+1)    │
//! │    loop { select! {                                                │
//! │      shutdown, timeout_rx, event_rx } → state.handle(event) }      │
//! │        │                    ▲                                      │
//! │        ▼                    │                                      │
//! │  TransportCommand     TimeoutTicker                                │
//! └────────┼───────────────────────────────────────────────────────────┘
//!          ▼
//!     transport (WireCodec)
//! ```
//!
//! The transport itself lives outside this crate: it drains
//! [`TransportCommand`]s, frames messages with [`WireCodec`] and feeds
//! decoded events back through [`Node::deliver`].

mod codec;
mod config;
pub mod metrics;
mod node;
mod runner;
pub mod telemetry;
mod ticker;

pub use codec::{CodecError, WireCodec, DEFAULT_MAX_MESSAGE_SIZE, WIRE_VERSION};
pub use config::{ConfigError, NodeConfig, SIGN_STATE_FILE};
pub use metrics::PrometheusObserver;
pub use node::{
    make_validators, CommitteeStatus, NextCommitteeStatus, Node, NodeEntry, NodeError,
    NotifyAction,
};
pub use runner::{ConsensusRunner, RunnerError, ShutdownHandle, TransportCommand};
pub use telemetry::{gather_metrics, init_telemetry, TelemetryConfig, TelemetryError};
pub use ticker::{TickerError, TimeoutTicker, DEFAULT_TICKER_CAPACITY};

//! Production runner implementation.

use crate::metrics;
use crate::ticker::{TimeoutTicker, DEFAULT_TICKER_CAPACITY};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tbft_bft::{ConsensusState, ConsensusStats, RoundStateSnapshot};
use tbft_core::{
    Action, Event, OutboundMessage, Service, ServiceError, StateMachine, TimeoutInfo,
};
use tbft_types::PeerId;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, span, trace, warn, Level};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Event channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// What the transport should do on behalf of one committee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Broadcast {
        committee_id: u64,
        message: OutboundMessage,
    },
    SendTo {
        committee_id: u64,
        peer: PeerId,
        message: OutboundMessage,
    },
    Penalize {
        committee_id: u64,
        peer: PeerId,
        reason: String,
    },
}

impl TransportCommand {
    pub fn committee_id(&self) -> u64 {
        match self {
            TransportCommand::Broadcast { committee_id, .. }
            | TransportCommand::SendTo { committee_id, .. }
            | TransportCommand::Penalize { committee_id, .. } => *committee_id,
        }
    }
}

/// Handle for shutting down a running [`ConsensusRunner`].
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Wall-clock time handed to the state machine.
fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Drives one committee's [`ConsensusState`] with real timers and channels.
///
/// A single task owns the state machine. Timeouts and inbound network
/// events arrive on separate channels; actions leave as
/// [`TransportCommand`]s or ticker schedules.
pub struct ConsensusRunner {
    committee_id: u64,
    state: ConsensusState,
    ticker: TimeoutTicker,
    timeout_rx: mpsc::Receiver<TimeoutInfo>,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    outbound_tx: mpsc::Sender<TransportCommand>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_rx: oneshot::Receiver<()>,
    status: Arc<RwLock<RoundStateSnapshot>>,
    last_stats: ConsensusStats,
}

impl ConsensusRunner {
    pub fn new(
        state: ConsensusState,
        outbound_tx: mpsc::Sender<TransportCommand>,
        channel_capacity: usize,
    ) -> Self {
        let (ticker, timeout_rx) = TimeoutTicker::new(DEFAULT_TICKER_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let status = Arc::new(RwLock::new(state.snapshot()));
        Self {
            committee_id: state.agent().committee_id(),
            last_stats: state.stats(),
            state,
            ticker,
            timeout_rx,
            event_tx,
            event_rx,
            outbound_tx,
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
            status,
        }
    }

    /// Get a sender for inbound network events.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    /// Latest round state, refreshed after every event.
    pub fn status(&self) -> Arc<RwLock<RoundStateSnapshot>> {
        self.status.clone()
    }

    /// Take the shutdown handle.
    ///
    /// Returns a handle that when dropped triggers graceful shutdown.
    /// Can only be called once; subsequent calls return None.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the main event loop until shutdown or until the committee's
    /// window is exhausted.
    ///
    /// # Priority Handling
    ///
    /// Uses `biased` select: shutdown first, then timeouts, then network
    /// events, so a flood of votes never delays a round timeout.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        self.ticker.start()?;
        info!(
            committee_id = self.committee_id,
            begin = self.state.agent().begin_height(),
            end = self.state.agent().end_height(),
            "Starting consensus runner"
        );

        self.state.set_time(wall_clock());
        let actions = self.state.start();
        self.process_actions(actions);
        self.publish_status();

        let result = loop {
            if self.state.is_finished() {
                info!(
                    committee_id = self.committee_id,
                    height = self.state.committed_height(),
                    "Committee window exhausted, stopping runner"
                );
                break Ok(());
            }

            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!(committee_id = self.committee_id, "Shutdown signal received");
                    break Ok(());
                }

                Some(timeout) = self.timeout_rx.recv() => {
                    self.dispatch(Event::TimeoutFired { timeout });
                }

                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        break Err(RunnerError::ChannelClosed);
                    };
                    self.dispatch(event);
                }
            }
        };

        self.ticker.stop();
        result
    }

    fn dispatch(&mut self, event: Event) {
        let event_span = span!(
            Level::DEBUG,
            "handle_event",
            event.type = event.type_name(),
            committee_id = self.committee_id,
        );
        let _guard = event_span.enter();

        self.state.set_time(wall_clock());
        let actions = self.state.handle(event);
        self.process_actions(actions);
        self.publish_status();
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.process_action(action);
        }
    }

    fn process_action(&mut self, action: Action) {
        let committee_id = self.committee_id;
        match action {
            Action::Broadcast { message } => {
                trace!(msg_type = message.type_name(), "Broadcast");
                self.send(TransportCommand::Broadcast {
                    committee_id,
                    message,
                });
            }

            Action::SendTo { peer, message } => {
                trace!(peer = %peer, msg_type = message.type_name(), "Send to peer");
                self.send(TransportCommand::SendTo {
                    committee_id,
                    peer,
                    message,
                });
            }

            Action::PenalizePeer { peer, reason } => {
                metrics::record_peer_penalized();
                warn!(peer = %peer, reason = %reason, "Penalizing peer");
                self.send(TransportCommand::Penalize {
                    committee_id,
                    peer,
                    reason,
                });
            }

            Action::ScheduleTimeout { timeout } => {
                if let Err(e) = self.ticker.schedule_timeout(timeout) {
                    debug!(error = %e, "Timeout not scheduled");
                }
            }

            Action::BlockCommitted {
                height,
                round,
                block_hash,
            } => {
                metrics::record_block_committed(height);
                info!(
                    committee_id,
                    height,
                    round,
                    block_hash = %block_hash,
                    "Block committed"
                );
            }
        }
    }

    /// Hand a command to the transport without blocking the state machine.
    fn send(&self, command: TransportCommand) {
        match self.outbound_tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                metrics::record_outbound_dropped();
                debug!(
                    committee_id = command.committee_id(),
                    "Transport queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Transport closed, dropping message");
            }
        }
    }

    fn publish_status(&mut self) {
        *self.status.write() = self.state.snapshot();
        let stats = self.state.stats();
        metrics::record_stats(&self.last_stats, &stats);
        self.last_stats = stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbft_bft::test_utils::MockChainAgent;
    use tbft_bft::{ConsensusConfig, PrivValidator, StateAgent};
    use tbft_core::RoundStep;
    use tbft_types::test_utils::{test_keys, test_validator_set};

    fn make_runner(
        validators: usize,
        end_height: u64,
        config: ConsensusConfig,
    ) -> (
        ConsensusRunner,
        Arc<MockChainAgent>,
        mpsc::Receiver<TransportCommand>,
    ) {
        let keys = test_keys(validators);
        let chain = Arc::new(MockChainAgent::new(0));
        let agent = Arc::new(StateAgent::new(
            chain.clone(),
            "runner-test",
            7,
            test_validator_set(&keys),
            1,
            Arc::new(PrivValidator::new(keys[0].clone())),
        ));
        if end_height > 0 {
            agent.set_end_height(end_height);
        }
        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let runner = ConsensusRunner::new(ConsensusState::new(config, agent), outbound_tx, 64);
        (runner, chain, outbound_rx)
    }

    fn fast_config() -> ConsensusConfig {
        ConsensusConfig {
            timeout_commit_ms: 5,
            ..ConsensusConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_validator_runs_to_window_end() {
        let (runner, chain, mut outbound) = make_runner(1, 3, fast_config());
        let status = runner.status();

        tokio::time::timeout(Duration::from_secs(60), runner.run())
            .await
            .expect("runner should finish")
            .unwrap();

        let heights: Vec<u64> = chain.committed().iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![1, 2, 3]);
        let snapshot = status.read().clone();
        assert!(snapshot.finished);
        assert_eq!(snapshot.committed_height, 3);
        assert_eq!(snapshot.committee_id, 7);

        let first = outbound.recv().await.unwrap();
        assert!(matches!(
            first,
            TransportCommand::Broadcast {
                committee_id: 7,
                message: OutboundMessage::Proposal(_),
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_handle_stops_runner() {
        let (mut runner, chain, _outbound) = make_runner(4, 0, ConsensusConfig::default());
        let handle = runner.shutdown_handle().unwrap();
        assert!(runner.shutdown_handle().is_none());
        let status = runner.status();

        let task = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(status.read().height, 1);
        assert!(status.read().step >= RoundStep::Propose);

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert!(chain.committed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_propose_timeout_advances_round_step() {
        let (runner, _chain, _outbound) = make_runner(4, 0, ConsensusConfig::default());
        let status = runner.status();
        let proposer = status.read().is_proposer;

        let task = tokio::spawn(runner.run());
        // Past timeout_propose for round 0.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let snapshot = status.read().clone();
        assert!(snapshot.stats.timeouts_fired >= 1 || proposer);
        assert!(snapshot.step >= RoundStep::Prevote);
        task.abort();
    }
}

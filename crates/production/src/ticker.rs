//! Timeout ticker for the production runner.
//!
//! A single tokio task owns one timer. Schedules arrive over a bounded
//! channel; a schedule with `wait` set only replaces the armed timer when
//! its (height, round, step) is newer than the last accepted one. Fired
//! timeouts are relayed on a short-lived task so the loop never blocks on a
//! slow consumer.

use tbft_core::{Lifecycle, Service, ServiceError, ServiceState, TimeoutInfo};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default capacity of the schedule queue.
pub const DEFAULT_TICKER_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TickerError {
    #[error("Timeout queue full, dropped {0}")]
    QueueFull(TimeoutInfo),

    #[error("Ticker stopped")]
    Stopped,
}

/// Tokio-driven timeout ticker.
pub struct TimeoutTicker {
    lifecycle: Lifecycle,
    schedule_tx: mpsc::Sender<TimeoutInfo>,
    /// Taken by the loop on start.
    schedule_rx: Option<mpsc::Receiver<TimeoutInfo>>,
    fired_tx: mpsc::Sender<TimeoutInfo>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TimeoutTicker {
    /// Create a stopped ticker and the receiver its fired timeouts go to.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (schedule_tx, schedule_rx) = mpsc::channel(capacity);
        let (fired_tx, fired_rx) = mpsc::channel(capacity);
        let ticker = Self {
            lifecycle: Lifecycle::new("timeout-ticker"),
            schedule_tx,
            schedule_rx: Some(schedule_rx),
            fired_tx,
            stop_tx: None,
            task: None,
        };
        (ticker, fired_rx)
    }

    /// Request a timeout. Never blocks; drops the request when the queue is
    /// full.
    pub fn schedule_timeout(&self, timeout: TimeoutInfo) -> Result<(), TickerError> {
        self.schedule_tx.try_send(timeout).map_err(|e| match e {
            mpsc::error::TrySendError::Full(ti) => {
                warn!(timeout = %ti, "Timeout queue full, dropping");
                TickerError::QueueFull(ti)
            }
            mpsc::error::TrySendError::Closed(_) => TickerError::Stopped,
        })
    }
}

impl Service for TimeoutTicker {
    fn start(&mut self) -> Result<(), ServiceError> {
        self.lifecycle.begin_start()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            self.lifecycle.mark_stopped();
            ServiceError::StartFailed {
                name: self.lifecycle.name(),
                reason: e.to_string(),
            }
        })?;
        let Some(schedule_rx) = self.schedule_rx.take() else {
            self.lifecycle.mark_stopped();
            return Err(ServiceError::StartFailed {
                name: self.lifecycle.name(),
                reason: "schedule queue already consumed".into(),
            });
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);
        self.task = Some(runtime.spawn(run_ticker(
            schedule_rx,
            self.fired_tx.clone(),
            stop_rx,
        )));
        self.lifecycle.mark_running();
        Ok(())
    }

    fn stop(&mut self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        // The loop exits on the signal; relays already spawned may still
        // deliver.
        self.task.take();
        self.lifecycle.mark_stopped();
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticker(
    mut schedule_rx: mpsc::Receiver<TimeoutInfo>,
    fired_tx: mpsc::Sender<TimeoutInfo>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let timer = tokio::time::sleep_until(Instant::now());
    tokio::pin!(timer);
    let mut armed = false;
    let mut last: Option<TimeoutInfo> = None;

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                debug!("Ticker stopping");
                break;
            }

            request = schedule_rx.recv() => {
                let Some(ti) = request else {
                    break;
                };
                if !ti.supersedes(last.as_ref()) {
                    trace!(timeout = %ti, "Ignoring stale timeout request");
                    continue;
                }
                trace!(timeout = %ti, "Arming timer");
                timer.as_mut().reset(Instant::now() + ti.duration);
                last = Some(ti);
                armed = true;
            }

            () = &mut timer, if armed => {
                armed = false;
                let Some(ti) = last else {
                    continue;
                };
                trace!(timeout = %ti, "Timeout fired");
                let tx = fired_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(ti).await;
                });
            }
        }
    }
}

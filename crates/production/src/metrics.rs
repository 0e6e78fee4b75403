//! Production metrics using native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use prometheus::{
    register_counter, register_gauge, register_histogram_vec, Counter, Gauge, HistogramVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tbft_bft::{AgentCall, AgentObserver, ConsensusStats};

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Consensus ===
    pub blocks_committed: Counter,
    pub block_height: Gauge,
    pub round_changes: Counter,
    pub commit_failures: Counter,
    pub timeouts_fired: Counter,

    // === Chain agent ===
    pub agent_call_latency: HistogramVec,

    // === Errors ===
    pub conflicting_votes: Counter,
    pub unwanted_round_votes: Counter,
    pub peers_penalized: Counter,

    // === Transport ===
    pub outbound_dropped: Counter,
    pub inbound_dropped: Counter,
}

impl Metrics {
    fn new() -> Self {
        // Latency buckets: 1ms to 10s
        let latency_buckets = vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ];

        Self {
            blocks_committed: register_counter!(
                "tbft_blocks_committed_total",
                "Total number of blocks committed"
            )
            .unwrap(),

            block_height: register_gauge!("tbft_block_height", "Last committed height").unwrap(),

            round_changes: register_counter!(
                "tbft_round_changes_total",
                "Rounds entered above round 0"
            )
            .unwrap(),

            commit_failures: register_counter!(
                "tbft_commit_failures_total",
                "Committed blocks the chain agent rejected"
            )
            .unwrap(),

            timeouts_fired: register_counter!(
                "tbft_timeouts_fired_total",
                "Round timeouts that advanced or retransmitted"
            )
            .unwrap(),

            agent_call_latency: register_histogram_vec!(
                "tbft_agent_call_latency_seconds",
                "Latency of calls into the chain agent",
                &["call", "result"],
                latency_buckets
            )
            .unwrap(),

            conflicting_votes: register_counter!(
                "tbft_conflicting_votes_total",
                "Equivocating votes detected"
            )
            .unwrap(),

            unwanted_round_votes: register_counter!(
                "tbft_unwanted_round_votes_total",
                "Votes rejected because the peer used up its catch-up rounds"
            )
            .unwrap(),

            peers_penalized: register_counter!(
                "tbft_peers_penalized_total",
                "Penalties reported to the transport"
            )
            .unwrap(),

            outbound_dropped: register_counter!(
                "tbft_outbound_dropped_total",
                "Outbound messages dropped because the transport queue was full"
            )
            .unwrap(),

            inbound_dropped: register_counter!(
                "tbft_inbound_dropped_total",
                "Inbound messages dropped because the runner queue was full"
            )
            .unwrap(),
        }
    }
}

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

// ═══════════════════════════════════════════════════════════════════════════
// Convenience functions
// ═══════════════════════════════════════════════════════════════════════════

/// Record a committed block.
pub fn record_block_committed(height: u64) {
    let m = metrics();
    m.blocks_committed.inc();
    m.block_height.set(height as f64);
}

/// Fold the counters that moved since `previous` into the registry.
pub fn record_stats(previous: &ConsensusStats, current: &ConsensusStats) {
    let m = metrics();
    let delta = |now: u64, before: u64| now.saturating_sub(before) as f64;
    m.round_changes
        .inc_by(delta(current.round_changes, previous.round_changes));
    m.commit_failures
        .inc_by(delta(current.commit_failures, previous.commit_failures));
    m.timeouts_fired
        .inc_by(delta(current.timeouts_fired, previous.timeouts_fired));
    m.conflicting_votes
        .inc_by(delta(current.conflicting_votes, previous.conflicting_votes));
    m.unwanted_round_votes.inc_by(delta(
        current.unwanted_round_votes,
        previous.unwanted_round_votes,
    ));
}

pub fn record_peer_penalized() {
    metrics().peers_penalized.inc();
}

pub fn record_outbound_dropped() {
    metrics().outbound_dropped.inc();
}

pub fn record_inbound_dropped() {
    metrics().inbound_dropped.inc();
}

/// Reports chain agent call latency into the prometheus registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusObserver;

impl AgentObserver for PrometheusObserver {
    fn observe(&self, call: AgentCall, elapsed: Duration, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        metrics()
            .agent_call_latency
            .with_label_values(&[call.as_str(), result])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_records_latency() {
        let before = metrics()
            .agent_call_latency
            .with_label_values(&["verify_block", "ok"])
            .get_sample_count();
        PrometheusObserver.observe(AgentCall::VerifyBlock, Duration::from_millis(3), true);
        let after = metrics()
            .agent_call_latency
            .with_label_values(&["verify_block", "ok"])
            .get_sample_count();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_record_stats_adds_deltas() {
        let before = metrics().timeouts_fired.get();
        let previous = ConsensusStats {
            timeouts_fired: 2,
            ..ConsensusStats::default()
        };
        let current = ConsensusStats {
            timeouts_fired: 5,
            ..ConsensusStats::default()
        };
        record_stats(&previous, &current);
        assert!(metrics().timeouts_fired.get() - before >= 3.0);
    }
}

//! End-to-end tests for deterministic simulation.
//!
//! These run entirely synchronously with simulated time:
//! - `run_until()` advances the simulation clock
//! - same seed always produces same results

use std::time::Duration;
use tbft_bft::ConsensusConfig;
use tbft_simulation::{NetworkConfig, SimulationRunner};
use tracing_test::traced_test;

fn fast_consensus() -> ConsensusConfig {
    ConsensusConfig {
        timeout_commit_ms: 200,
        ..ConsensusConfig::default()
    }
}

fn network(packet_loss_rate: f64) -> NetworkConfig {
    NetworkConfig {
        validators: 4,
        latency: Duration::from_millis(20),
        jitter_fraction: 0.2,
        packet_loss_rate,
    }
}

#[traced_test]
#[test]
fn test_first_height_commits_in_round_zero() {
    let mut sim = SimulationRunner::new(network(0.0), fast_consensus(), 1);
    sim.set_end_height(1);
    sim.start();
    sim.run_until(Duration::from_secs(10));

    assert_eq!(sim.chain_heights(), vec![1, 1, 1, 1]);
    assert!(sim.chains_agree());
    for i in 0..4 {
        let node = sim.node(i).unwrap();
        assert!(node.is_finished());
        assert_eq!(node.stats().round_changes, 0);
        assert_eq!(sim.chain(i).unwrap().rejected_commits(), 0);
    }
    assert_eq!(sim.stats().blocks_committed, 4);
    assert_eq!(sim.stats().messages_dropped(), 0);
}

#[traced_test]
#[test]
fn test_window_of_heights_is_committed_identically() {
    let mut sim = SimulationRunner::new(network(0.0), fast_consensus(), 2);
    sim.set_end_height(5);
    sim.start();
    let done = sim.run_until_condition(Duration::from_secs(120), Duration::from_millis(500), |s| {
        (0..4).all(|i| s.node(i).is_some_and(|n| n.is_finished()))
    });
    assert!(done, "heights reached: {:?}", sim.chain_heights());

    assert_eq!(sim.chain_heights(), vec![5, 5, 5, 5]);
    assert!(sim.chains_agree());

    // Proposers rotate, so more than one validator authored a block.
    let proposers: std::collections::HashSet<_> = sim
        .chain(0)
        .unwrap()
        .committed()
        .iter()
        .map(|b| b.proposer)
        .collect();
    assert!(proposers.len() > 1);
}

#[traced_test]
#[test]
fn test_lossy_network_stays_safe_and_live() {
    let mut sim = SimulationRunner::new(network(0.05), fast_consensus(), 3);
    sim.start();
    let done = sim.run_until_condition(Duration::from_secs(300), Duration::from_secs(1), |s| {
        s.chain_heights().iter().filter(|&&h| h >= 2).count() >= 3
    });

    assert!(done, "heights reached: {:?}", sim.chain_heights());
    assert!(sim.chains_agree());
    assert!(sim.stats().messages_dropped_loss > 0);
}

#[traced_test]
#[test]
fn test_isolated_validator_catches_up_after_heal() {
    let mut sim = SimulationRunner::new(network(0.0), fast_consensus(), 4);
    sim.network_mut().isolate_node(3);
    sim.start();

    let majority_committed =
        sim.run_until_condition(Duration::from_secs(120), Duration::from_millis(100), |s| {
            s.min_height(&[0, 1, 2]) >= 1
        });
    assert!(majority_committed, "heights reached: {:?}", sim.chain_heights());
    assert_eq!(sim.chain(3).unwrap().height(), 0);
    assert!(sim.stats().messages_dropped_partition > 0);

    sim.network_mut().heal_all();
    let limit = sim.now() + Duration::from_secs(120);
    let caught_up = sim.run_until_condition(limit, Duration::from_millis(500), |s| {
        s.chain(3).is_some_and(|c| c.height() >= 2)
    });
    assert!(caught_up, "heights reached: {:?}", sim.chain_heights());
    assert!(sim.chains_agree());
}

#[traced_test]
#[test]
fn test_minority_partition_cannot_commit() {
    let mut sim = SimulationRunner::new(network(0.0), fast_consensus(), 5);
    sim.network_mut().partition_groups(&[0, 1], &[2, 3]);
    sim.start();
    sim.run_until(Duration::from_secs(30));

    // Neither half holds more than two thirds of the voting power.
    assert_eq!(sim.chain_heights(), vec![0, 0, 0, 0]);
    for i in 0..4 {
        assert!(sim.node(i).unwrap().stats().timeouts_fired > 0);
        assert_eq!(sim.chain(i).unwrap().rejected_commits(), 0);
    }
}

#[test]
fn test_same_seed_same_run() {
    let run = |seed: u64| {
        let mut sim = SimulationRunner::new(network(0.05), fast_consensus(), seed);
        sim.set_end_height(3);
        sim.start();
        sim.run_until(Duration::from_secs(60));
        let hashes: Vec<_> = (0..4)
            .map(|i| sim.chain(i).unwrap().committed_hashes())
            .collect();
        (hashes, sim.stats().events_processed, sim.stats().messages_sent)
    };

    let first = run(42);
    let second = run(42);
    assert_eq!(first, second);
}

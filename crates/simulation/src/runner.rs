//! Deterministic simulation runner.
//!
//! Each node has its own chain agent and signer. Timeouts are emulated with
//! the same replacement rule as the production ticker: a node has at most one
//! armed timeout, and a request only replaces it when it is newer.

use crate::chain::SimChain;
use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tbft_bft::{ConsensusConfig, ConsensusState, PrivValidator, StateAgent};
use tbft_core::{Action, Event, StateMachine, TimeoutInfo};
use tbft_types::{Hash, KeyPair, PeerId, Validator, ValidatorSet};
use tracing::{debug, info, trace};

const CHAIN_ID: &str = "tbft-sim";
const COMMITTEE_ID: u64 = 1;
const PAYLOAD_SIZE: usize = 256;

/// Emulated ticker of one node.
#[derive(Debug, Default)]
struct NodeTimer {
    last: Option<TimeoutInfo>,
    pending: Option<EventKey>,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub actions_generated: u64,
    /// Messages scheduled for delivery.
    pub messages_sent: u64,
    pub messages_dropped_partition: u64,
    pub messages_dropped_loss: u64,
    pub timeouts_scheduled: u64,
    /// Requests the emulated ticker ignored as stale.
    pub timeouts_ignored: u64,
    pub blocks_committed: u64,
    pub peers_penalized: u64,
}

impl SimulationStats {
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    nodes: Vec<ConsensusState>,
    chains: Vec<Arc<SimChain>>,
    peers: Vec<PeerId>,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,
    sequence: u64,
    now: Duration,

    network: SimulatedNetwork,
    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,
    timers: Vec<NodeTimer>,
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Panics if `network_config.validators` is zero.
    pub fn new(network_config: NetworkConfig, consensus: ConsensusConfig, seed: u64) -> Self {
        let count = network_config.validators;
        let keys: Vec<KeyPair> = (0..count)
            .map(|i| {
                let mut seed_bytes = [0u8; 32];
                let key_seed = seed.wrapping_add(i as u64).wrapping_mul(0x517cc1b727220a95);
                seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
                seed_bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                KeyPair::from_seed(seed_bytes)
            })
            .collect();
        let validators = keys
            .iter()
            .map(|k| Validator::new(k.public_key(), 1))
            .collect();
        let validators = match ValidatorSet::new(validators) {
            Ok(set) => set,
            Err(e) => panic!("simulation needs at least one validator: {e}"),
        };

        let mut nodes = Vec::new();
        let mut chains = Vec::new();
        for key in &keys {
            let chain = Arc::new(SimChain::new(key.clone(), PAYLOAD_SIZE));
            let agent = StateAgent::new(
                chain.clone(),
                CHAIN_ID,
                COMMITTEE_ID,
                validators.clone(),
                1,
                Arc::new(PrivValidator::new(key.clone())),
            );
            nodes.push(ConsensusState::new(consensus.clone(), Arc::new(agent)));
            chains.push(chain);
        }
        let peers = keys
            .iter()
            .map(|k| PeerId::from_address(&k.address()))
            .collect();

        info!(num_nodes = count, seed, "Created simulation runner");

        Self {
            timers: (0..count).map(|_| NodeTimer::default()).collect(),
            nodes,
            chains,
            peers,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimulatedNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            stats: SimulationStats::default(),
        }
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&ConsensusState> {
        self.nodes.get(index as usize)
    }

    pub fn chain(&self, index: NodeIndex) -> Option<&Arc<SimChain>> {
        self.chains.get(index as usize)
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// For partition and loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// Bound every node's committee window.
    pub fn set_end_height(&self, height: u64) {
        for node in &self.nodes {
            node.agent().set_end_height(height);
        }
    }

    /// Chain height of every node.
    pub fn chain_heights(&self) -> Vec<u64> {
        self.chains.iter().map(|c| c.height()).collect()
    }

    /// Lowest chain height across `nodes`.
    pub fn min_height(&self, nodes: &[NodeIndex]) -> u64 {
        nodes
            .iter()
            .filter_map(|&i| self.chains.get(i as usize))
            .map(|c| c.height())
            .min()
            .unwrap_or(0)
    }

    /// True if no two nodes committed different blocks at the same height.
    pub fn chains_agree(&self) -> bool {
        let chains: Vec<Vec<Hash>> = self.chains.iter().map(|c| c.committed_hashes()).collect();
        chains.iter().all(|a| {
            chains
                .iter()
                .all(|b| a.iter().zip(b.iter()).all(|(x, y)| x == y))
        })
    }

    /// Start consensus on every node.
    pub fn start(&mut self) {
        for index in 0..self.nodes.len() {
            let node = &mut self.nodes[index];
            node.set_time(self.now);
            let actions = node.start();
            self.process_actions(index as NodeIndex, actions);
        }
    }

    /// Run simulation until no more events or time limit reached.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                debug!(
                    remaining_events = self.event_queue.len(),
                    "Time limit reached"
                );
                break;
            }
            let Some((key, event)) = self.event_queue.pop_first() else {
                break;
            };
            self.now = key.time;
            let node_index = key.node_index;

            if let Event::TimeoutFired { .. } = &event {
                let timer = &mut self.timers[node_index as usize];
                if timer.pending == Some(key) {
                    timer.pending = None;
                }
            }

            trace!(time = ?self.now, node = node_index, event = event.type_name(), "Processing event");
            self.stats.events_processed += 1;

            let node = &mut self.nodes[node_index as usize];
            node.set_time(self.now);
            let actions = node.handle(event);
            self.process_actions(node_index, actions);
        }
        self.now = self.now.max(end_time);
    }

    /// Run in `step` increments until `done` holds or `limit` is reached.
    /// Returns whether `done` held.
    pub fn run_until_condition(
        &mut self,
        limit: Duration,
        step: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> bool {
        while self.now < limit {
            if done(self) {
                return true;
            }
            let next = (self.now + step).min(limit);
            self.run_until(next);
        }
        done(self)
    }

    fn process_actions(&mut self, from: NodeIndex, actions: Vec<Action>) {
        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(from, action);
        }
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in self.network.all_nodes() {
                    if to != from {
                        let event =
                            Event::from_message(message.clone(), self.peers[from as usize].clone());
                        self.try_deliver_message(from, to, event);
                    }
                }
            }

            Action::SendTo { peer, message } => {
                if let Some(to) = self.peers.iter().position(|p| *p == peer) {
                    let event = Event::from_message(message, self.peers[from as usize].clone());
                    self.try_deliver_message(from, to as NodeIndex, event);
                }
            }

            Action::PenalizePeer { peer, reason } => {
                self.stats.peers_penalized += 1;
                debug!(node = from, peer = %peer, reason = %reason, "Peer penalized");
            }

            Action::ScheduleTimeout { timeout } => self.schedule_timeout(from, timeout),

            Action::BlockCommitted {
                height,
                round,
                block_hash,
            } => {
                self.stats.blocks_committed += 1;
                debug!(node = from, height, round, block_hash = %block_hash, "Block committed");
            }
        }
    }

    fn schedule_timeout(&mut self, node: NodeIndex, timeout: TimeoutInfo) {
        let timer = &self.timers[node as usize];
        if !timeout.supersedes(timer.last.as_ref()) {
            self.stats.timeouts_ignored += 1;
            return;
        }
        if let Some(pending) = timer.pending {
            self.event_queue.remove(&pending);
        }
        let key = self.schedule_event(
            node,
            self.now + timeout.duration,
            Event::TimeoutFired { timeout },
        );
        let timer = &mut self.timers[node as usize];
        timer.last = Some(timeout);
        timer.pending = Some(key);
        self.stats.timeouts_scheduled += 1;
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Try to deliver a message, accounting for partitions and packet loss.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, event: Event) {
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from, to, "Message dropped due to partition");
            return;
        }
        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from, to, "Message dropped due to packet loss");
            return;
        }
        let latency = self.network.sample_latency(&mut self.rng);
        self.schedule_event(to, self.now + latency, event);
        self.stats.messages_sent += 1;
    }
}

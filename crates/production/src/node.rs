//! Committee registry for one node.
//!
//! The chain agent hands the node every committee it belongs to, then tells it
//! which one to run. Each registered committee owns a [`StateAgent`]; starting
//! it spawns a [`ConsensusRunner`] on the current tokio runtime. At most one
//! previously started committee is kept around: starting a new one retires it.

use crate::config::NodeConfig;
use crate::metrics::{self, PrometheusObserver};
use crate::runner::{ConsensusRunner, RunnerError, ShutdownHandle, TransportCommand};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tbft_bft::{
    AgentObserver, ChainAgent, ConsensusConfig, ConsensusState, PrivValidator,
    RoundStateSnapshot, StateAgent,
};
use tbft_core::{Event, Lifecycle, Service, ServiceError, ServiceState};
use tbft_types::{
    CommitteeInfo, CommitteeMember, CommitteeNode, MemberFlag, MemberType, PeerId, ValidatorSet,
    ValidatorSetError,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Committee {0} has no members")]
    EmptyCommittee(u64),

    #[error("Committee {0} is already registered")]
    DuplicateCommittee(u64),

    #[error("Committee {id} has {size} members, at least {min} required")]
    CommitteeTooSmall { id: u64, size: usize, min: usize },

    #[error("Unknown committee {0}")]
    UnknownCommittee(u64),

    #[error("No nodes given for committee {0}")]
    EmptyNodes(u64),

    #[error("Invalid committee {id}: {reason}")]
    InvalidCommittee { id: u64, reason: String },

    #[error(transparent)]
    Validators(#[from] ValidatorSetError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// What the chain agent asks of a committee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    Start,
    Stop,
    /// Prepare the network for the next committee. Nothing to do here; the
    /// transport owns connections.
    Switch,
}

/// A committee member as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeEntry {
    pub flag: MemberFlag,
    /// `ip:port` once [`Node::put_nodes`] supplied it.
    pub addr: Option<String>,
}

/// Serializable view of one committee.
#[derive(Debug, Clone, Serialize)]
pub struct CommitteeStatus {
    pub id: u64,
    pub state: ServiceState,
    pub begin_height: u64,
    pub end_height: u64,
    pub nodes: BTreeMap<PeerId, NodeEntry>,
    pub round_state: Option<RoundStateSnapshot>,
    /// The committee registered right after this one, if any.
    pub next: Option<NextCommitteeStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextCommitteeStatus {
    pub id: u64,
    pub nodes: BTreeMap<PeerId, NodeEntry>,
}

/// Validator set of every used member, in committee order.
pub fn make_validators(info: &CommitteeInfo) -> Result<ValidatorSet, NodeError> {
    if info.members.is_empty() {
        return Err(NodeError::EmptyCommittee(info.id));
    }
    Ok(info.validator_set()?)
}

fn member_table(info: &CommitteeInfo) -> BTreeMap<PeerId, NodeEntry> {
    info.all_members()
        .map(|m| {
            (
                PeerId::from_address(&m.validator_address()),
                NodeEntry {
                    flag: m.flag,
                    addr: None,
                },
            )
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Committee service
// ═══════════════════════════════════════════════════════════════════════════

struct RunningCommittee {
    shutdown: Option<ShutdownHandle>,
    events: mpsc::Sender<Event>,
    status: Arc<RwLock<RoundStateSnapshot>>,
    task: JoinHandle<Result<(), RunnerError>>,
}

/// One registered committee and, once started, its runner.
struct CommitteeService {
    info: CommitteeInfo,
    agent: Arc<StateAgent>,
    consensus: ConsensusConfig,
    channel_capacity: usize,
    outbound: mpsc::Sender<TransportCommand>,
    nodes: BTreeMap<PeerId, NodeEntry>,
    running: Option<RunningCommittee>,
    lifecycle: Lifecycle,
}

impl CommitteeService {
    fn round_state(&self) -> Option<RoundStateSnapshot> {
        self.running.as_ref().map(|r| r.status.read().clone())
    }

    fn status(&self, next: Option<NextCommitteeStatus>) -> CommitteeStatus {
        CommitteeStatus {
            id: self.info.id,
            state: self.lifecycle.state(),
            begin_height: self.agent.begin_height(),
            end_height: self.agent.end_height(),
            nodes: self.nodes.clone(),
            round_state: self.round_state(),
            next,
        }
    }
}

impl Service for CommitteeService {
    fn start(&mut self) -> Result<(), ServiceError> {
        self.lifecycle.begin_start()?;
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.lifecycle.mark_stopped();
                return Err(ServiceError::StartFailed {
                    name: self.lifecycle.name(),
                    reason: e.to_string(),
                });
            }
        };

        let state = ConsensusState::new(self.consensus.clone(), self.agent.clone());
        let mut runner = ConsensusRunner::new(state, self.outbound.clone(), self.channel_capacity);
        let shutdown = runner.shutdown_handle();
        let events = runner.event_sender();
        let status = runner.status();
        let task = handle.spawn(runner.run());

        self.running = Some(RunningCommittee {
            shutdown,
            events,
            status,
            task,
        });
        self.lifecycle.mark_running();
        Ok(())
    }

    fn stop(&mut self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        if let Some(mut running) = self.running.take() {
            if let Some(shutdown) = running.shutdown.take() {
                shutdown.shutdown();
            }
            // The runner exits on its own once it sees the signal.
            drop(running.task);
        }
        self.lifecycle.mark_stopped();
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Node
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Registry {
    services: HashMap<u64, CommitteeService>,
    /// Last committee started through [`NotifyAction::Start`].
    previous: Option<u64>,
}

/// Every committee this node takes part in.
pub struct Node {
    config: NodeConfig,
    chain: Arc<dyn ChainAgent>,
    priv_validator: Arc<PrivValidator>,
    observer: Arc<dyn AgentObserver>,
    outbound: mpsc::Sender<TransportCommand>,
    registry: Mutex<Registry>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainAgent>,
        priv_validator: Arc<PrivValidator>,
        outbound: mpsc::Sender<TransportCommand>,
    ) -> Self {
        info!(
            chain_id = %config.chain_id,
            moniker = %config.moniker,
            address = %priv_validator.address(),
            "Created node"
        );
        Self {
            config,
            chain,
            priv_validator,
            observer: Arc::new(PrometheusObserver),
            outbound,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Register a committee. It does not run until started.
    #[instrument(skip(self, info), fields(committee_id = info.id))]
    pub fn put_committee(&self, info: CommitteeInfo) -> Result<(), NodeError> {
        let id = info.id;
        if info.members.is_empty() {
            return Err(NodeError::EmptyCommittee(id));
        }
        let min = self.config.consensus.min_committee_size;
        if info.members.len() < min {
            return Err(NodeError::CommitteeTooSmall {
                id,
                size: info.members.len(),
                min,
            });
        }

        let mut registry = self.registry.lock();
        if registry.services.contains_key(&id) {
            return Err(NodeError::DuplicateCommittee(id));
        }

        let validators = make_validators(&info)?;
        let agent = StateAgent::new(
            self.chain.clone(),
            self.config.chain_id.clone(),
            id,
            validators,
            info.start_height,
            self.priv_validator.clone(),
        )
        .with_observer(self.observer.clone());
        if info.end_height > info.start_height {
            agent.set_end_height(info.end_height);
        }

        info!(committee = %info, "Registered committee");
        let service = CommitteeService {
            nodes: member_table(&info),
            info,
            agent: Arc::new(agent),
            consensus: self.config.consensus.clone(),
            channel_capacity: self.config.channel_capacity,
            outbound: self.outbound.clone(),
            running: None,
            lifecycle: Lifecycle::new("committee"),
        };
        registry.services.insert(id, service);
        Ok(())
    }

    /// Start, stop or switch committee `id`.
    #[instrument(skip(self))]
    pub fn notify(&self, id: u64, action: NotifyAction) -> Result<(), NodeError> {
        let mut registry = self.registry.lock();
        match action {
            NotifyAction::Start => {
                if !registry.services.contains_key(&id) {
                    return Err(NodeError::UnknownCommittee(id));
                }
                if let Some(previous) = registry.previous.filter(|&p| p != id) {
                    if let Some(mut retired) = registry.services.remove(&previous) {
                        retired.stop();
                        info!(committee_id = previous, "Retired previous committee");
                    }
                }
                registry.previous = Some(id);

                let service = registry
                    .services
                    .get_mut(&id)
                    .ok_or(NodeError::UnknownCommittee(id))?;
                info!(
                    committee_id = id,
                    begin = service.agent.begin_height(),
                    end = service.agent.end_height(),
                    "Starting committee"
                );
                service.start()?;
                Ok(())
            }
            NotifyAction::Stop => {
                if let Some(service) = registry.services.get_mut(&id) {
                    info!(committee_id = id, "Stopping committee");
                    service.stop();
                }
                Ok(())
            }
            NotifyAction::Switch => Ok(()),
        }
    }

    /// Record where committee members listen.
    pub fn put_nodes(&self, id: u64, nodes: &[CommitteeNode]) -> Result<(), NodeError> {
        if nodes.is_empty() {
            return Err(NodeError::EmptyNodes(id));
        }
        let mut registry = self.registry.lock();
        let service = registry
            .services
            .get_mut(&id)
            .ok_or(NodeError::UnknownCommittee(id))?;

        for node in nodes {
            let peer = PeerId::from_address(&node.public_key.address());
            let addr = format!("{}:{}", node.ip, node.port_for(id));
            match service.nodes.get_mut(&peer) {
                Some(entry) => {
                    if entry.addr.as_deref() != Some(addr.as_str()) {
                        debug!(committee_id = id, peer = %peer, addr = %addr, "Updated node address");
                        entry.addr = Some(addr);
                    }
                }
                None => trace!(committee_id = id, peer = %peer, "Ignoring node outside committee"),
            }
        }
        Ok(())
    }

    /// Apply a membership change.
    ///
    /// Returns the peers of removed members so the transport can drop them.
    /// When the local validator itself was removed the committee stops.
    #[instrument(skip(self, info), fields(committee_id = info.id))]
    pub fn update_committee(&self, info: CommitteeInfo) -> Result<Vec<PeerId>, NodeError> {
        let mut registry = self.registry.lock();
        let service = registry
            .services
            .get_mut(&info.id)
            .ok_or(NodeError::UnknownCommittee(info.id))?;

        let local_key = self.priv_validator.public_key();
        let mut self_removed = false;
        let removed: Vec<PeerId> = info
            .removed_members()
            .inspect(|m| self_removed |= m.public_key == local_key)
            .map(|m| PeerId::from_address(&m.validator_address()))
            .collect();

        service.agent.update_validator(make_validators(&info)?, true);
        if info.end_height > info.start_height {
            service.agent.set_end_height(info.end_height);
        }
        service.agent.set_begin_height(info.start_height);

        for (peer, entry) in member_table(&info) {
            service
                .nodes
                .entry(peer)
                .and_modify(|existing| existing.flag = entry.flag)
                .or_insert(entry);
        }
        service.info = info;

        if let Some(running) = &service.running {
            for peer in &removed {
                send_peer_removed(&running.events, service.info.id, peer);
            }
        }

        if self_removed {
            warn!(committee_id = service.info.id, "Local validator removed from committee");
            service.stop();
        }
        info!(
            committee_id = service.info.id,
            removed = removed.len(),
            validators = service.agent.validators().len(),
            "Updated committee"
        );
        Ok(removed)
    }

    /// Set the last height committee `id` decides.
    pub fn set_committee_stop(&self, id: u64, height: u64) -> Result<(), NodeError> {
        let registry = self.registry.lock();
        let service = registry
            .services
            .get(&id)
            .ok_or(NodeError::UnknownCommittee(id))?;
        service.agent.set_end_height(height);
        Ok(())
    }

    pub fn committee_status(&self, id: u64) -> Option<CommitteeStatus> {
        let registry = self.registry.lock();
        let next = id.checked_add(1).and_then(|next_id| {
            registry.services.get(&next_id).map(|s| NextCommitteeStatus {
                id: next_id,
                nodes: s.nodes.clone(),
            })
        });
        registry.services.get(&id).map(|s| s.status(next))
    }

    /// Whether the local validator proposes the current round of committee
    /// `id`.
    pub fn is_leader(&self, id: u64) -> bool {
        let registry = self.registry.lock();
        registry
            .services
            .get(&id)
            .and_then(CommitteeService::round_state)
            .is_some_and(|s| s.is_proposer)
    }

    /// Hand an inbound event to committee `id`.
    ///
    /// Events for a committee that is not running are dropped.
    pub fn deliver(&self, id: u64, event: Event) -> Result<(), NodeError> {
        let registry = self.registry.lock();
        let service = registry
            .services
            .get(&id)
            .ok_or(NodeError::UnknownCommittee(id))?;
        let Some(running) = &service.running else {
            trace!(committee_id = id, "Committee not running, dropping event");
            return Ok(());
        };
        match running.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::record_inbound_dropped();
                debug!(
                    committee_id = id,
                    event_type = event.type_name(),
                    "Runner queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(committee_id = id, "Runner exited, dropping event");
            }
        }
        Ok(())
    }

    /// The transport dropped `peer`; tell every running committee.
    pub fn remove_peer(&self, peer: &PeerId) {
        let registry = self.registry.lock();
        for (id, service) in &registry.services {
            if let Some(running) = &service.running {
                send_peer_removed(&running.events, *id, peer);
            }
        }
    }

    /// Check member flags, and for every committee after the first, that the
    /// fixed back members match the chain's seed members.
    pub fn verify_committee_info(&self, info: &CommitteeInfo) -> Result<(), NodeError> {
        let invalid = |reason: &str| NodeError::InvalidCommittee {
            id: info.id,
            reason: reason.to_string(),
        };

        if info.id == 0 {
            let all_seeds = info
                .members
                .iter()
                .all(|m| m.flag == MemberFlag::Used && m.member_type == MemberType::Fixed);
            return if all_seeds {
                Ok(())
            } else {
                Err(invalid("first committee must consist of used seed members"))
            };
        }

        if info
            .members
            .iter()
            .any(|m| !matches!(m.flag, MemberFlag::Used | MemberFlag::Removed))
        {
            return Err(invalid("members must be used or removed"));
        }

        let seeds: Vec<&CommitteeMember> = info
            .back_members
            .iter()
            .filter(|m| m.member_type == MemberType::Fixed)
            .collect();
        let chain_seeds = self.chain.seed_members();
        if seeds.is_empty() || chain_seeds.is_empty() || seeds.len() != chain_seeds.len() {
            return Err(invalid("seed member count mismatch"));
        }
        if !seeds.iter().zip(&chain_seeds).all(|(a, b)| a.same_as(b)) {
            return Err(invalid("seed members differ from chain"));
        }
        Ok(())
    }
}

/// Tell a committee runner that `peer` is gone. A dropped notice leaves the
/// runner holding state for the peer, so it is logged and counted.
fn send_peer_removed(events: &mpsc::Sender<Event>, committee_id: u64, peer: &PeerId) {
    let event = Event::PeerRemoved { peer: peer.clone() };
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics::record_inbound_dropped();
            warn!(committee_id, peer = %peer, "Runner queue full, dropping peer removal");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(committee_id, peer = %peer, "Runner exited, dropping peer removal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tbft_bft::test_utils::MockChainAgent;
    use tbft_types::test_utils::{test_committee, test_key, test_keys};
    use tbft_types::KeyPair;
    use tracing_test::traced_test;

    struct Harness {
        node: Node,
        keys: Vec<KeyPair>,
        chain: Arc<MockChainAgent>,
        _outbound: mpsc::Receiver<TransportCommand>,
    }

    fn harness() -> Harness {
        let keys = test_keys(4);
        let chain = Arc::new(MockChainAgent::new(0));
        let (tx, rx) = mpsc::channel(1024);
        let node = Node::new(
            NodeConfig::new("node-test"),
            chain.clone(),
            Arc::new(PrivValidator::new(keys[0].clone())),
            tx,
        );
        Harness {
            node,
            keys,
            chain,
            _outbound: rx,
        }
    }

    fn seed(key: &KeyPair) -> CommitteeMember {
        CommitteeMember::new(key.public_key(), MemberFlag::Used, MemberType::Fixed)
    }

    #[traced_test]
    #[test]
    fn test_put_committee_validates_input() {
        let h = harness();
        let mut empty = test_committee(1, 1, &h.keys);
        empty.members.clear();
        assert!(matches!(
            h.node.put_committee(empty),
            Err(NodeError::EmptyCommittee(1))
        ));

        let small = test_committee(1, 1, &h.keys[..3]);
        assert!(matches!(
            h.node.put_committee(small),
            Err(NodeError::CommitteeTooSmall { size: 3, min: 4, .. })
        ));

        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        assert!(matches!(
            h.node.put_committee(test_committee(1, 1, &h.keys)),
            Err(NodeError::DuplicateCommittee(1))
        ));

        let status = h.node.committee_status(1).unwrap();
        assert_eq!(status.state, ServiceState::Idle);
        assert_eq!(status.nodes.len(), 4);
        assert!(status.round_state.is_none());
        assert!(!h.node.is_leader(1));
    }

    #[test]
    fn test_end_height_only_set_past_start() {
        let h = harness();
        let mut info = test_committee(1, 10, &h.keys);
        info.end_height = 5;
        h.node.put_committee(info).unwrap();
        assert_eq!(h.node.committee_status(1).unwrap().end_height, 0);

        let mut info = test_committee(2, 10, &h.keys);
        info.end_height = 20;
        h.node.put_committee(info).unwrap();
        let status = h.node.committee_status(2).unwrap();
        assert_eq!((status.begin_height, status.end_height), (10, 20));
    }

    #[test]
    fn test_notify_without_runtime_or_committee() {
        let h = harness();
        assert!(matches!(
            h.node.notify(9, NotifyAction::Start),
            Err(NodeError::UnknownCommittee(9))
        ));
        h.node.notify(9, NotifyAction::Stop).unwrap();
        h.node.notify(9, NotifyAction::Switch).unwrap();

        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        assert!(matches!(
            h.node.notify(1, NotifyAction::Start),
            Err(NodeError::Service(ServiceError::StartFailed { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_committee() {
        let h = harness();
        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        h.node.notify(1, NotifyAction::Start).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = h.node.committee_status(1).unwrap();
        assert_eq!(status.state, ServiceState::Running);
        let round_state = status.round_state.unwrap();
        assert_eq!(round_state.height, 1);
        assert_eq!(h.node.is_leader(1), round_state.is_proposer);

        // Starting twice is rejected by the lifecycle.
        assert!(matches!(
            h.node.notify(1, NotifyAction::Start),
            Err(NodeError::Service(ServiceError::CannotStart { .. }))
        ));

        h.node.notify(1, NotifyAction::Stop).unwrap();
        h.node.notify(1, NotifyAction::Stop).unwrap();
        let status = h.node.committee_status(1).unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        assert!(status.round_state.is_none());
        assert!(!h.node.is_leader(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_next_committee_retires_previous() {
        let h = harness();
        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        h.node.put_committee(test_committee(2, 1, &h.keys)).unwrap();

        h.node.notify(1, NotifyAction::Start).unwrap();
        let status = h.node.committee_status(1).unwrap();
        assert_eq!(status.next.map(|n| n.id), Some(2));

        h.node.notify(2, NotifyAction::Start).unwrap();
        assert!(h.node.committee_status(1).is_none());
        assert_eq!(
            h.node.committee_status(2).unwrap().state,
            ServiceState::Running
        );
    }

    #[test]
    fn test_put_nodes_uses_committee_port() {
        let h = harness();
        h.node.put_committee(test_committee(3, 1, &h.keys)).unwrap();
        assert!(matches!(
            h.node.put_nodes(3, &[]),
            Err(NodeError::EmptyNodes(3))
        ));

        let node = |key: &KeyPair| CommitteeNode {
            public_key: key.public_key(),
            ip: "10.0.0.1".into(),
            port: 30310,
            port2: 30311,
        };
        let outsider = test_key(42);
        h.node
            .put_nodes(3, &[node(&h.keys[1]), node(&outsider)])
            .unwrap();
        assert!(matches!(
            h.node.put_nodes(4, &[node(&h.keys[1])]),
            Err(NodeError::UnknownCommittee(4))
        ));

        let status = h.node.committee_status(3).unwrap();
        let peer = PeerId::from_address(&h.keys[1].address());
        assert_eq!(status.nodes[&peer].addr.as_deref(), Some("10.0.0.1:30311"));
        assert_eq!(status.nodes.len(), 4);
    }

    #[traced_test]
    #[test]
    fn test_update_committee_reports_removed_members() {
        let h = harness();
        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();

        let mut info = test_committee(1, 1, &h.keys);
        info.members[3].flag = MemberFlag::Removed;
        info.end_height = 50;
        let removed = h.node.update_committee(info).unwrap();
        let peer = PeerId::from_address(&h.keys[3].address());
        assert_eq!(removed, vec![peer.clone()]);

        let status = h.node.committee_status(1).unwrap();
        assert_eq!(status.nodes[&peer].flag, MemberFlag::Removed);
        assert_eq!(status.end_height, 50);
        assert_eq!(status.state, ServiceState::Idle);

        assert!(matches!(
            h.node.update_committee(test_committee(8, 1, &h.keys)),
            Err(NodeError::UnknownCommittee(8))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_committee_stops_removed_local_validator() {
        let h = harness();
        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        h.node.notify(1, NotifyAction::Start).unwrap();

        let mut info = test_committee(1, 1, &h.keys);
        info.members[0].flag = MemberFlag::Removed;
        h.node.update_committee(info).unwrap();
        assert_eq!(
            h.node.committee_status(1).unwrap().state,
            ServiceState::Stopped
        );
    }

    #[test]
    fn test_set_committee_stop() {
        let h = harness();
        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        h.node.set_committee_stop(1, 99).unwrap();
        assert_eq!(h.node.committee_status(1).unwrap().end_height, 99);
        assert!(matches!(
            h.node.set_committee_stop(2, 99),
            Err(NodeError::UnknownCommittee(2))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_routes_to_running_committee() {
        let h = harness();
        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        let event = Event::PeerRemoved {
            peer: PeerId::from("gone"),
        };

        // Not running yet: dropped quietly.
        h.node.deliver(1, event.clone()).unwrap();
        assert!(matches!(
            h.node.deliver(5, event.clone()),
            Err(NodeError::UnknownCommittee(5))
        ));

        h.node.notify(1, NotifyAction::Start).unwrap();
        h.node.deliver(1, event).unwrap();
        h.node.remove_peer(&PeerId::from("gone"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            h.node.committee_status(1).unwrap().state,
            ServiceState::Running
        );
    }

    #[test]
    fn test_verify_first_committee_requires_seed_members() {
        let h = harness();
        let mut info = test_committee(0, 1, &h.keys);
        info.members = h.keys.iter().map(seed).collect();
        h.node.verify_committee_info(&info).unwrap();

        info.members[2].member_type = MemberType::Worked;
        assert!(matches!(
            h.node.verify_committee_info(&info),
            Err(NodeError::InvalidCommittee { id: 0, .. })
        ));
    }

    #[traced_test]
    #[test]
    fn test_verify_committee_checks_seeds_against_chain() {
        let h = harness();
        let seeds: Vec<CommitteeMember> = test_keys(6)[4..].iter().map(seed).collect();
        h.chain.set_seed_members(seeds.clone());

        let mut info = test_committee(5, 100, &h.keys);
        info.back_members = seeds.clone();
        h.node.verify_committee_info(&info).unwrap();

        // Unused members are not allowed in the main list.
        let mut unused = info.clone();
        unused.members[1].flag = MemberFlag::Unused;
        assert!(h.node.verify_committee_info(&unused).is_err());

        // Seed mismatch.
        let mut wrong = info.clone();
        wrong.back_members[0].flag = MemberFlag::Removed;
        assert!(h.node.verify_committee_info(&wrong).is_err());

        // Missing seeds.
        let mut missing = info;
        missing.back_members.truncate(1);
        assert!(h.node.verify_committee_info(&missing).is_err());
    }

    #[test]
    fn test_status_serializes() {
        let h = harness();
        h.node.put_committee(test_committee(1, 1, &h.keys)).unwrap();
        let status = h.node.committee_status(1).unwrap();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["state"], "idle");
        assert_eq!(json["nodes"].as_object().unwrap().len(), 4);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_peer_removal_on_full_queue_is_logged_and_counted() {
        let (tx, mut rx) = mpsc::channel(1);
        let gone = PeerId::from("gone");
        send_peer_removed(&tx, 7, &gone);
        assert!(!logs_contain("dropping peer removal"));

        let before = metrics::metrics().inbound_dropped.get();
        send_peer_removed(&tx, 7, &PeerId::from("also-gone"));
        assert!(logs_contain("Runner queue full, dropping peer removal"));
        assert!(metrics::metrics().inbound_dropped.get() - before >= 1.0);

        // The queued notice is the first one.
        match rx.recv().await {
            Some(Event::PeerRemoved { peer }) => assert_eq!(peer, gone),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

//! Four nodes wired together through in-process channels and the wire codec.

use std::sync::Arc;
use std::time::Duration;
use tbft_bft::test_utils::MockChainAgent;
use tbft_bft::{ConsensusConfig, PrivValidator};
use tbft_production::{Node, NodeConfig, NotifyAction, TransportCommand, WireCodec};
use tbft_types::test_utils::{test_committee, test_keys};
use tbft_types::PeerId;
use tokio::sync::mpsc;

const COMMITTEE: u64 = 1;

struct Network {
    nodes: Vec<Arc<Node>>,
    peers: Vec<PeerId>,
    chains: Vec<Arc<MockChainAgent>>,
}

fn build_network(end_height: u64) -> (Network, Vec<mpsc::Receiver<TransportCommand>>) {
    let keys = test_keys(4);
    let mut config = NodeConfig::new("integration");
    config.consensus = ConsensusConfig {
        timeout_commit_ms: 10,
        ..ConsensusConfig::default()
    };

    let mut nodes = Vec::new();
    let mut chains = Vec::new();
    let mut outbound = Vec::new();
    for key in &keys {
        let chain = Arc::new(MockChainAgent::new(0));
        let (tx, rx) = mpsc::channel(4096);
        let node = Node::new(
            config.clone(),
            chain.clone(),
            Arc::new(PrivValidator::new(key.clone())),
            tx,
        );
        let mut info = test_committee(COMMITTEE, 1, &keys);
        info.end_height = end_height;
        node.put_committee(info).unwrap();
        nodes.push(Arc::new(node));
        chains.push(chain);
        outbound.push(rx);
    }

    let peers = keys.iter().map(|k| PeerId::from_address(&k.address())).collect();
    (
        Network {
            nodes,
            peers,
            chains,
        },
        outbound,
    )
}

/// Forward every command from node `from` to its destination through the
/// codec, as a transport would.
fn spawn_router(
    from: usize,
    mut rx: mpsc::Receiver<TransportCommand>,
    nodes: Vec<Arc<Node>>,
    peers: Vec<PeerId>,
) {
    let codec = WireCodec::default();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let (targets, message) = match command {
                TransportCommand::Broadcast { message, .. } => {
                    ((0..nodes.len()).filter(|&i| i != from).collect(), message)
                }
                TransportCommand::SendTo { peer, message, .. } => {
                    let targets: Vec<usize> = peers
                        .iter()
                        .position(|p| *p == peer)
                        .into_iter()
                        .collect();
                    (targets, message)
                }
                TransportCommand::Penalize { .. } => continue,
            };
            let bytes = codec.encode(&message).unwrap();
            for target in targets {
                let event = codec.decode_event(&bytes, peers[from].clone()).unwrap();
                nodes[target].deliver(COMMITTEE, event).unwrap();
            }
        }
    });
}

#[tokio::test(start_paused = true)]
async fn test_four_nodes_commit_whole_window() {
    let (network, outbound) = build_network(3);
    for (i, rx) in outbound.into_iter().enumerate() {
        spawn_router(i, rx, network.nodes.clone(), network.peers.clone());
    }
    for node in &network.nodes {
        node.notify(COMMITTEE, NotifyAction::Start).unwrap();
    }

    let chains = network.chains.clone();
    tokio::time::timeout(Duration::from_secs(120), async move {
        while chains.iter().any(|c| c.committed().len() < 3) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("every node should commit heights 1..=3");

    let reference: Vec<_> = network.chains[0].committed().iter().map(|b| b.hash()).collect();
    for chain in &network.chains {
        let committed = chain.committed();
        let heights: Vec<u64> = committed.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![1, 2, 3]);
        let hashes: Vec<_> = committed.iter().map(|b| b.hash()).collect();
        assert_eq!(hashes, reference);
    }

    // Let the runners observe the window end.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in &network.nodes {
        let round_state = node.committee_status(COMMITTEE).unwrap().round_state.unwrap();
        assert!(round_state.finished);
        assert_eq!(round_state.committed_height, 3);
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_of_four_nodes_still_commit() {
    let (network, outbound) = build_network(2);
    for (i, rx) in outbound.into_iter().enumerate() {
        spawn_router(i, rx, network.nodes.clone(), network.peers.clone());
    }
    // Node 3 never starts; its events are dropped.
    for node in &network.nodes[..3] {
        node.notify(COMMITTEE, NotifyAction::Start).unwrap();
    }

    let chains = network.chains[..3].to_vec();
    tokio::time::timeout(Duration::from_secs(600), async move {
        while chains.iter().any(|c| c.committed().len() < 2) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("three live validators out of four should keep committing");

    assert!(network.chains[3].committed().is_empty());
}

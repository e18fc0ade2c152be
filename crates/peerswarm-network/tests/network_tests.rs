//! End-to-end tests: network managers talking through in-memory rendezvous
//! servers and the in-memory transport.
//!
//! Verifies:
//! - Two peers connect to each other, both Connected
//! - Fully connected swarms converge to a full mesh, one connection per peer
//! - MMST swarms never exceed their connection cap
//! - Star swarms only ever connect leaves to the hub
//! - Leaving a swarm closes the remote side
//! - Duplicate candidates from several servers do not duplicate connections
//! - Swarm maps and the manager's topic registry

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use peerswarm_network::*;
use peerswarm_protocol::*;
use peerswarm_signal::{MemoryConnector, MemoryRendezvous, RpcConnector};
use peerswarm_topology::{FullyConnectedTopology, MmstConfig, MmstTopology, StarTopology, Topology};

const WAIT: Duration = Duration::from_secs(10);

fn peer(b: u8) -> PeerId {
    PeerId::from_bytes([b; 32])
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn connected_to(rx: &watch::Receiver<Vec<ConnectionInfo>>, peers: &[PeerId]) -> bool {
    let infos = rx.borrow();
    infos.len() == peers.len()
        && infos
            .iter()
            .all(|c| peers.contains(&c.remote_id) && c.state == ConnectionState::Connected)
}

/// Rendezvous servers and transport shared by every node of a test.
struct TestNet {
    servers: Vec<MemoryRendezvous>,
    connector: Arc<dyn RpcConnector>,
    transport: Arc<MemoryTransport>,
}

impl TestNet {
    fn new(server_count: usize) -> Self {
        let servers: Vec<MemoryRendezvous> =
            (0..server_count).map(|_| MemoryRendezvous::new()).collect();
        let connector = servers
            .iter()
            .enumerate()
            .fold(MemoryConnector::new(), |c, (i, server)| {
                c.with_server(format!("rendezvous-{i}"), server.clone())
            });
        Self {
            servers,
            connector: Arc::new(connector),
            transport: Arc::new(MemoryTransport::default()),
        }
    }

    async fn node(&self) -> NetworkManager {
        let config = NetworkConfig {
            signal: SignalConfig {
                servers: (0..self.servers.len()).map(|i| format!("rendezvous-{i}")).collect(),
                rpc_timeout_ms: 1_000,
                reconnect_retry_ms: 100,
            },
            ..Default::default()
        };
        let node = NetworkManager::new(config, self.connector.clone(), self.transport.clone());
        node.start().await;
        node
    }

    /// Wait until `peer` is listed on every server.
    async fn announced(&self, topic: &Topic, peer: PeerId) {
        eventually(|| self.servers.iter().all(|s| s.peers(topic).contains(&peer))).await;
    }
}

async fn join(
    net: &TestNet,
    node: &NetworkManager,
    topic: Topic,
    id: PeerId,
    topology: Box<dyn Topology>,
) -> SwarmHandle {
    let swarm = node
        .join_swarm(SwarmOptions::new(topic, id, topology))
        .unwrap();
    net.announced(&topic, id).await;
    swarm
}

// ═══════════════════════════════════════════════════════════════
// Fully connected
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn two_peers_end_up_connected() {
    let net = TestNet::new(1);
    let topic = Topic::random();
    let (a, b) = (net.node().await, net.node().await);

    let sa = join(&net, &a, topic, peer(1), Box::new(FullyConnectedTopology::new())).await;
    let sb = join(&net, &b, topic, peer(2), Box::new(FullyConnectedTopology::new())).await;

    let (ra, rb) = (sa.watch_connections(), sb.watch_connections());
    eventually(|| connected_to(&ra, &[peer(2)]) && connected_to(&rb, &[peer(1)])).await;

    let ca = sa.connections().await.unwrap();
    let cb = sb.connections().await.unwrap();
    assert_eq!(ca[0].session_id, cb[0].session_id);
    // The later joiner learned of the earlier one and dialed.
    assert!(cb[0].initiator);
}

#[tokio::test]
async fn fully_connected_swarm_forms_a_mesh() {
    let net = TestNet::new(1);
    let topic = Topic::random();
    let ids: Vec<PeerId> = (1..=4).map(peer).collect();

    let mut nodes = Vec::new();
    let mut swarms = Vec::new();
    for id in &ids {
        let node = net.node().await;
        swarms.push(join(&net, &node, topic, *id, Box::new(FullyConnectedTopology::new())).await);
        nodes.push(node);
    }

    let receivers: Vec<_> = swarms.iter().map(|s| s.watch_connections()).collect();
    eventually(|| {
        receivers.iter().zip(&ids).all(|(rx, own)| {
            let others: Vec<PeerId> = ids.iter().filter(|p| *p != own).copied().collect();
            connected_to(rx, &others)
        })
    })
    .await;

    for swarm in &swarms {
        assert_eq!(swarm.connections().await.unwrap().len(), ids.len() - 1);
    }
}

#[tokio::test]
async fn duplicate_servers_do_not_duplicate_connections() {
    let net = TestNet::new(2);
    let topic = Topic::random();
    let (a, b) = (net.node().await, net.node().await);

    let sa = join(&net, &a, topic, peer(1), Box::new(FullyConnectedTopology::new())).await;
    let sb = join(&net, &b, topic, peer(2), Box::new(FullyConnectedTopology::new())).await;

    let (ra, rb) = (sa.watch_connections(), sb.watch_connections());
    eventually(|| connected_to(&ra, &[peer(2)]) && connected_to(&rb, &[peer(1)])).await;
    assert_eq!(b.signal().candidates(&topic), vec![peer(1), peer(2)]);

    // Both servers keep relaying; nothing new should appear.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connected_to(&ra, &[peer(2)]));
    assert!(connected_to(&rb, &[peer(1)]));
}

// ═══════════════════════════════════════════════════════════════
// MMST and star
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn mmst_respects_the_connection_cap() {
    let net = TestNet::new(1);
    let topic = Topic::random();
    let config = MmstConfig {
        originate_connections: 2,
        max_peers: 3,
        sample_size: 10,
        lookup_timeout: Duration::from_millis(50),
    };

    let mut nodes = Vec::new();
    let mut receivers = Vec::new();
    for i in 1..=6u8 {
        let node = net.node().await;
        let swarm = join(&net, &node, topic, peer(i), Box::new(MmstTopology::new(config.clone()))).await;
        receivers.push(swarm.watch_connections());
        nodes.push(node);
        for rx in &receivers {
            assert!(rx.borrow().len() <= config.max_peers);
        }
    }

    // The last joiner saw five candidates and opens its own connections.
    let last = receivers[receivers.len() - 1].clone();
    eventually(|| {
        let infos = last.borrow();
        !infos.is_empty() && infos.iter().all(|c| c.state == ConnectionState::Connected)
    })
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while tokio::time::Instant::now() < deadline {
        for rx in &receivers {
            assert!(rx.borrow().len() <= config.max_peers);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn star_connects_leaves_to_the_hub_only() {
    let net = TestNet::new(1);
    let topic = Topic::random();
    let hub = peer(9);

    let hub_node = net.node().await;
    let hub_swarm = join(&net, &hub_node, topic, hub, Box::new(StarTopology::new(hub))).await;

    let mut leaves = Vec::new();
    for i in 1..=3u8 {
        let node = net.node().await;
        let swarm = join(&net, &node, topic, peer(i), Box::new(StarTopology::new(hub))).await;
        leaves.push((node, swarm.watch_connections()));
    }

    let hub_rx = hub_swarm.watch_connections();
    eventually(|| {
        connected_to(&hub_rx, &[peer(1), peer(2), peer(3)])
            && leaves.iter().all(|(_, rx)| connected_to(rx, &[hub]))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    for (_, rx) in &leaves {
        assert!(connected_to(rx, &[hub]));
    }
}

// ═══════════════════════════════════════════════════════════════
// Leaving and registry
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn leaving_closes_the_remote_connection() {
    let net = TestNet::new(1);
    let topic = Topic::random();
    let (a, b) = (net.node().await, net.node().await);

    let sa = join(&net, &a, topic, peer(1), Box::new(FullyConnectedTopology::new())).await;
    let sb = join(&net, &b, topic, peer(2), Box::new(FullyConnectedTopology::new())).await;
    let (ra, rb) = (sa.watch_connections(), sb.watch_connections());
    eventually(|| connected_to(&ra, &[peer(2)]) && connected_to(&rb, &[peer(1)])).await;

    b.leave_swarm(&topic).await.unwrap();

    eventually(|| ra.borrow().is_empty()).await;
    assert!(b.swarm(&topic).is_none());
    assert!(b.topics().is_empty());
    eventually(|| !net.servers[0].peers(&topic).contains(&peer(2))).await;
}

#[tokio::test]
async fn joining_twice_and_leaving_unknown_topics_fail() {
    let net = TestNet::new(1);
    let topic = Topic::random();
    let node = net.node().await;

    node.join_swarm(SwarmOptions::new(topic, peer(1), Box::new(FullyConnectedTopology::new())))
        .unwrap();
    let again = node.join_swarm(SwarmOptions::new(topic, peer(1), Box::new(FullyConnectedTopology::new())));
    assert!(matches!(again, Err(NetworkError::AlreadyJoined(t)) if t == topic));

    let other = Topic::random();
    assert!(matches!(
        node.leave_swarm(&other).await,
        Err(NetworkError::NotJoined(t)) if t == other
    ));
    assert_eq!(node.topics(), vec![topic]);
}

#[tokio::test]
async fn one_node_can_swarm_on_several_topics() {
    let net = TestNet::new(1);
    let (t1, t2) = (Topic::random(), Topic::random());
    let (a, b) = (net.node().await, net.node().await);

    let a1 = join(&net, &a, t1, peer(1), Box::new(FullyConnectedTopology::new())).await;
    let a2 = join(&net, &a, t2, peer(3), Box::new(FullyConnectedTopology::new())).await;
    let b1 = join(&net, &b, t1, peer(2), Box::new(FullyConnectedTopology::new())).await;

    let (r1, r2, rb) = (a1.watch_connections(), a2.watch_connections(), b1.watch_connections());
    eventually(|| connected_to(&r1, &[peer(2)]) && connected_to(&rb, &[peer(1)])).await;
    assert!(r2.borrow().is_empty());

    a.destroy().await;
    assert!(a.topics().is_empty());
    eventually(|| rb.borrow().is_empty()).await;
}

#[tokio::test]
async fn swarm_map_tracks_connections() {
    let net = TestNet::new(1);
    let topic = Topic::random();
    let (a, b) = (net.node().await, net.node().await);

    join(&net, &a, topic, peer(1), Box::new(FullyConnectedTopology::new())).await;
    let map = a.swarm_map(&topic).unwrap();
    assert_eq!(
        map.peers(),
        vec![PeerState {
            id: peer(1),
            state: PeerStatus::Me,
            connections: vec![],
        }]
    );
    let mut updates = map.subscribe();

    join(&net, &b, topic, peer(2), Box::new(FullyConnectedTopology::new())).await;
    eventually(|| {
        map.peers()
            == vec![
                PeerState {
                    id: peer(1),
                    state: PeerStatus::Me,
                    connections: vec![],
                },
                PeerState {
                    id: peer(2),
                    state: PeerStatus::Connection(ConnectionState::Connected),
                    connections: vec![peer(1)],
                },
            ]
    })
    .await;
    assert!(!matches!(updates.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
}

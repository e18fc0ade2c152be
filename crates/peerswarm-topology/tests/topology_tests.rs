//! Tests for the peer-selection strategies.
//!
//! Verifies:
//! - FullyConnected connects to every candidate
//! - Star keeps non-hub peers attached only to the hub
//! - MMST defers until a sample is collected, caps its degree and prefers near peers
//! - Topology timers deliver wakeups and stop on destroy

use std::time::Duration;

use peerswarm_protocol::{PeerId, KEY_LENGTH};
use peerswarm_topology::*;
use tokio::sync::mpsc;

fn peer(first: u8) -> PeerId {
    let mut bytes = [0u8; KEY_LENGTH];
    bytes[0] = first;
    PeerId::from_bytes(bytes)
}

/// In-process stand-in for a swarm. Records every decision a topology makes.
struct MockController {
    own: PeerId,
    connected: Vec<PeerId>,
    candidates: Vec<PeerId>,
    connects: Vec<PeerId>,
    disconnects: Vec<PeerId>,
    lookups: usize,
    scheduler: Scheduler,
    wakeups: mpsc::UnboundedReceiver<Wakeup>,
}

impl MockController {
    fn new(own: PeerId) -> Self {
        let (scheduler, wakeups) = Scheduler::channel();
        Self {
            own,
            connected: Vec::new(),
            candidates: Vec::new(),
            connects: Vec::new(),
            disconnects: Vec::new(),
            lookups: 0,
            scheduler,
            wakeups,
        }
    }

    fn with_candidates(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.candidates.extend(peers);
        self
    }

    fn with_connected(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.connected.extend(peers);
        self
    }

    fn drain_wakeups(&mut self) -> Vec<Wakeup> {
        let mut out = Vec::new();
        while let Ok(w) = self.wakeups.try_recv() {
            out.push(w);
        }
        out
    }
}

impl SwarmController for MockController {
    fn state(&self) -> SwarmState {
        SwarmState {
            own_peer_id: self.own,
            connected: self.connected.clone(),
            candidates: self.candidates.clone(),
        }
    }

    fn connect(&mut self, peer: PeerId) {
        if self.connected.contains(&peer) {
            return;
        }
        self.candidates.retain(|p| *p != peer);
        self.connected.push(peer);
        self.connects.push(peer);
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.connected.retain(|p| *p != peer);
        self.disconnects.push(peer);
    }

    fn lookup(&mut self) {
        self.lookups += 1;
    }

    fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }
}

// ═══════════════════════════════════════════════════════════════
// FullyConnected
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn fully_connected_connects_every_candidate() {
    let mut ctl = MockController::new(peer(0)).with_candidates([peer(1), peer(2), peer(3)]);
    let mut topology = FullyConnectedTopology::default();

    topology.init(&mut ctl);
    topology.update(&mut ctl);

    assert_eq!(ctl.connects, vec![peer(1), peer(2), peer(3)]);
    assert!(ctl.candidates.is_empty());
    assert!(ctl.disconnects.is_empty());
}

#[tokio::test]
async fn fully_connected_accepts_every_offer() {
    let mut ctl = MockController::new(peer(0)).with_connected((1..=20).map(peer));
    let mut topology = FullyConnectedTopology::default();
    assert!(topology.on_offer(&peer(42), &mut ctl));
    assert_eq!(topology.name(), "fully-connected");
}

// ═══════════════════════════════════════════════════════════════
// Star
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn star_leaf_connects_to_hub_only() {
    let hub = peer(9);
    let mut ctl = MockController::new(peer(1)).with_candidates([peer(2), hub, peer(3)]);
    let mut topology = StarTopology::new(hub);

    topology.init(&mut ctl);
    topology.update(&mut ctl);

    assert_eq!(ctl.connects, vec![hub]);
    assert_eq!(ctl.connected, vec![hub]);
}

#[tokio::test]
async fn star_leaf_drops_non_hub_connections() {
    let hub = peer(9);
    let mut ctl = MockController::new(peer(1)).with_connected([peer(2), hub, peer(3)]);
    let mut topology = StarTopology::new(hub);

    topology.update(&mut ctl);

    assert_eq!(ctl.disconnects, vec![peer(2), peer(3)]);
    assert_eq!(ctl.connected, vec![hub]);
}

#[tokio::test]
async fn star_hub_keeps_every_connection() {
    let hub = peer(9);
    let mut ctl = MockController::new(hub)
        .with_connected([peer(1), peer(2)])
        .with_candidates([peer(3)]);
    let mut topology = StarTopology::new(hub);

    topology.update(&mut ctl);

    assert!(ctl.disconnects.is_empty());
    assert!(ctl.connects.is_empty(), "Hub waits for leaves to come to it");
}

#[tokio::test]
async fn star_offer_policy() {
    let hub = peer(9);

    let mut hub_ctl = MockController::new(hub);
    let mut hub_topology = StarTopology::new(hub);
    assert!(hub_topology.on_offer(&peer(1), &mut hub_ctl));

    let mut leaf_ctl = MockController::new(peer(1));
    let mut leaf_topology = StarTopology::new(hub);
    assert!(leaf_topology.on_offer(&hub, &mut leaf_ctl));
    assert!(!leaf_topology.on_offer(&peer(2), &mut leaf_ctl));
}

#[tokio::test(start_paused = true)]
async fn star_requests_periodic_lookups_until_destroyed() {
    let mut ctl = MockController::new(peer(1));
    let mut topology = StarTopology::new(peer(9)).with_lookup_interval(Duration::from_secs(1));

    topology.init(&mut ctl);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(ctl.drain_wakeups(), vec![Wakeup::Lookup, Wakeup::Lookup]);

    topology.destroy();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(ctl.drain_wakeups().is_empty());
}

// ═══════════════════════════════════════════════════════════════
// MMST
// ═══════════════════════════════════════════════════════════════

#[test]
fn mmst_default_config() {
    let config = MmstConfig::default();
    assert_eq!(config.originate_connections, 2);
    assert_eq!(config.max_peers, 4);
    assert_eq!(config.sample_size, 10);
    assert_eq!(config.lookup_timeout, Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn mmst_waits_for_sample_before_running() {
    let mut ctl = MockController::new(peer(0)).with_candidates((1..=5).map(peer));
    let mut topology = MmstTopology::default();

    topology.init(&mut ctl);
    topology.update(&mut ctl);

    assert!(!topology.sample_collected());
    assert!(ctl.connects.is_empty(), "Only 5 peers known, sample needs more than 10");
}

#[tokio::test(start_paused = true)]
async fn mmst_runs_after_lookup_timeout() {
    let mut ctl = MockController::new(peer(0)).with_candidates([peer(7), peer(3), peer(5), peer(1)]);
    let mut topology = MmstTopology::default();

    topology.init(&mut ctl);
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    assert_eq!(ctl.drain_wakeups(), vec![Wakeup::Update]);

    topology.update(&mut ctl);
    assert!(topology.sample_collected());
    // Nearest two by XOR distance from 0x00..
    assert_eq!(ctl.connects, vec![peer(1), peer(3)]);
}

#[tokio::test(start_paused = true)]
async fn mmst_runs_immediately_with_full_sample() {
    let mut ctl = MockController::new(peer(0)).with_candidates((1..=11).map(peer));
    let mut topology = MmstTopology::default();

    topology.init(&mut ctl);
    topology.update(&mut ctl);

    assert!(topology.sample_collected());
    assert_eq!(ctl.connects.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn mmst_disconnects_furthest_when_over_capacity() {
    let mut ctl = MockController::new(peer(0)).with_connected((1..=6).map(peer));
    let mut topology = MmstTopology::default();

    topology.init(&mut ctl);
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    topology.update(&mut ctl);

    assert_eq!(ctl.connected.len(), 4);
    assert_eq!(ctl.disconnects.len(), 2);
    assert!(ctl.disconnects.contains(&peer(6)));
    assert!(ctl.disconnects.contains(&peer(5)));
    assert!(ctl.connects.is_empty());
}

#[tokio::test(start_paused = true)]
async fn mmst_leaves_degree_alone_between_bounds() {
    let mut ctl = MockController::new(peer(0))
        .with_connected([peer(1), peer(2), peer(3)])
        .with_candidates([peer(4), peer(5)]);
    let mut topology = MmstTopology::default();

    topology.init(&mut ctl);
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    topology.update(&mut ctl);

    assert!(ctl.connects.is_empty());
    assert!(ctl.disconnects.is_empty());
}

#[tokio::test(start_paused = true)]
async fn mmst_respects_custom_config() {
    let config = MmstConfig {
        originate_connections: 3,
        max_peers: 5,
        sample_size: 3,
        lookup_timeout: Duration::from_millis(10),
    };
    let mut ctl = MockController::new(peer(0)).with_candidates([peer(1), peer(2), peer(4), peer(8)]);
    let mut topology = MmstTopology::new(config);

    topology.init(&mut ctl);
    topology.update(&mut ctl);

    assert!(topology.sample_collected(), "4 known peers exceed a sample size of 3");
    assert_eq!(ctl.connects.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn mmst_offer_accepted_below_max_peers() {
    let mut topology = MmstTopology::default();

    let mut ctl = MockController::new(peer(0)).with_connected((1..=3).map(peer));
    assert!(topology.on_offer(&peer(9), &mut ctl));

    let mut full = MockController::new(peer(0)).with_connected((1..=4).map(peer));
    assert!(!topology.on_offer(&peer(9), &mut full));
}

#[tokio::test(start_paused = true)]
async fn mmst_requests_fallback_lookup() {
    let mut ctl = MockController::new(peer(0));
    let mut topology = MmstTopology::default();

    topology.init(&mut ctl);
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(ctl.drain_wakeups(), vec![Wakeup::Update, Wakeup::Lookup]);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(ctl.drain_wakeups().is_empty(), "Fallback lookup fires once");
}

#[tokio::test(start_paused = true)]
async fn mmst_destroy_cancels_timers() {
    let mut ctl = MockController::new(peer(0));
    let mut topology = MmstTopology::default();

    topology.init(&mut ctl);
    topology.destroy();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(ctl.drain_wakeups().is_empty());
    assert_eq!(topology.name(), "mmst");
}

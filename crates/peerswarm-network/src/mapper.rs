//! Peer-state projection of one swarm for presentation layers.
//!
//! The map lists this node, its direct connections and, when a presence graph
//! is supplied, every other peer known to be in the swarm together with the
//! edges the presence graph reports between them. It is rebuilt from scratch
//! on every connection event and every presence update.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use peerswarm_protocol::PeerId;

use crate::connection::ConnectionState;
use crate::swarm::{ConnectionInfo, SwarmEvent, SwarmHandle};

const MAP_CHANNEL_CAPACITY: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Directly connected, in the given connection state.
    Connection(ConnectionState),
    /// Known from the presence graph only.
    IndirectlyConnected,
    Me,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerState {
    pub id: PeerId,
    pub state: PeerStatus,
    /// Peers this one is known to be linked to.
    pub connections: Vec<PeerId>,
}

/// Directed edge of a presence graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GraphLink {
    pub source: PeerId,
    pub target: PeerId,
}

/// Swarm-wide membership graph maintained outside the network layer.
pub trait GraphSource: Send + Sync {
    fn nodes(&self) -> Vec<PeerId>;

    fn links(&self) -> Vec<GraphLink>;

    /// Fires whenever nodes or links change.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

/// Build the peer map. Entries keep insertion order: self first, then direct
/// connections, then presence-only peers.
pub fn map_peers(
    own_peer_id: PeerId,
    connections: &[ConnectionInfo],
    presence: Option<&dyn GraphSource>,
) -> Vec<PeerState> {
    let mut peers = Vec::with_capacity(connections.len() + 1);
    peers.push(PeerState {
        id: own_peer_id,
        state: PeerStatus::Me,
        connections: Vec::new(),
    });
    peers.extend(connections.iter().map(|c| PeerState {
        id: c.remote_id,
        state: PeerStatus::Connection(c.state),
        connections: vec![own_peer_id],
    }));

    let Some(presence) = presence else {
        return peers;
    };
    for node in presence.nodes() {
        if !peers.iter().any(|p| p.id == node) {
            peers.push(PeerState {
                id: node,
                state: PeerStatus::IndirectlyConnected,
                connections: Vec::new(),
            });
        }
    }
    for link in presence.links() {
        match peers.iter_mut().find(|p| p.id == link.source) {
            Some(entry) => entry.connections.push(link.target),
            // Edge from a node the graph has not listed yet.
            None => peers.push(PeerState {
                id: link.source,
                state: PeerStatus::IndirectlyConnected,
                connections: vec![link.target],
            }),
        }
    }
    peers
}

/// Keeps the peer map of one swarm current.
pub struct SwarmMapper {
    latest: Arc<Mutex<Vec<PeerState>>>,
    map_tx: broadcast::Sender<Vec<PeerState>>,
    task: JoinHandle<()>,
}

impl SwarmMapper {
    /// Build the initial map and start following the swarm.
    pub fn new(swarm: &SwarmHandle, presence: Option<Arc<dyn GraphSource>>) -> Self {
        let own_peer_id = swarm.own_peer_id();
        // Subscribed before the first build so no change slips in between.
        let events = swarm.subscribe();
        let connections_rx = swarm.watch_connections();
        let initial = map_peers(
            own_peer_id,
            &connections_rx.borrow(),
            presence.as_deref(),
        );
        let latest = Arc::new(Mutex::new(initial));
        let (map_tx, _) = broadcast::channel(MAP_CHANNEL_CAPACITY);

        let task = tokio::spawn(follow(
            own_peer_id,
            events,
            connections_rx,
            presence,
            latest.clone(),
            map_tx.clone(),
        ));

        Self {
            latest,
            map_tx,
            task,
        }
    }

    /// Latest map.
    pub fn peers(&self) -> Vec<PeerState> {
        lock(&self.latest).clone()
    }

    /// Every rebuilt map from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<PeerState>> {
        self.map_tx.subscribe()
    }

    /// Stop following the swarm. The latest map stays readable.
    pub fn destroy(&self) {
        self.task.abort();
    }
}

impl Drop for SwarmMapper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Rebuild on every swarm event. The event stream says when, the connection
/// watch says what: it is published before the event is sent.
async fn follow(
    own_peer_id: PeerId,
    mut events: broadcast::Receiver<SwarmEvent>,
    mut connections_rx: watch::Receiver<Vec<ConnectionInfo>>,
    presence: Option<Arc<dyn GraphSource>>,
    latest: Arc<Mutex<Vec<PeerState>>>,
    map_tx: broadcast::Sender<Vec<PeerState>>,
) {
    let mut presence_rx = presence.as_ref().map(|p| p.subscribe());
    loop {
        let presence_changed = async {
            match presence_rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };
        let presence_closed = tokio::select! {
            event = events.recv() => {
                match event {
                    // Same transition as the StateChanged before it.
                    Ok(SwarmEvent::Connected(_)) => continue,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "Swarm map fell behind, rebuilding");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                false
            }
            // Handles may outlive the swarm task, so its end is seen here.
            closed = connections_rx.changed() => {
                if closed.is_err() {
                    break;
                }
                continue;
            }
            received = presence_changed => {
                matches!(received, Err(broadcast::error::RecvError::Closed))
            }
        };
        if presence_closed {
            tracing::debug!("Presence graph closed");
            presence_rx = None;
        }

        let connections = connections_rx.borrow().clone();
        let map = map_peers(own_peer_id, &connections, presence.as_deref());
        *lock(&latest) = map.clone();
        let _ = map_tx.send(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerswarm_protocol::SessionId;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 32])
    }

    fn info(remote: u8, state: ConnectionState) -> ConnectionInfo {
        ConnectionInfo {
            remote_id: peer(remote),
            session_id: SessionId::from_bytes([remote; 32]),
            initiator: true,
            state,
        }
    }

    struct StaticGraph {
        nodes: Vec<PeerId>,
        links: Vec<GraphLink>,
        tx: broadcast::Sender<()>,
    }

    impl GraphSource for StaticGraph {
        fn nodes(&self) -> Vec<PeerId> {
            self.nodes.clone()
        }
        fn links(&self) -> Vec<GraphLink> {
            self.links.clone()
        }
        fn subscribe(&self) -> broadcast::Receiver<()> {
            self.tx.subscribe()
        }
    }

    #[test]
    fn lone_peer_maps_to_itself() {
        let map = map_peers(peer(1), &[], None);
        assert_eq!(
            map,
            vec![PeerState {
                id: peer(1),
                state: PeerStatus::Me,
                connections: vec![],
            }]
        );
    }

    #[test]
    fn direct_connections_point_back_at_self() {
        let map = map_peers(
            peer(1),
            &[
                info(2, ConnectionState::Connected),
                info(3, ConnectionState::Initiating),
            ],
            None,
        );
        assert_eq!(map.len(), 3);
        assert_eq!(map[1].state, PeerStatus::Connection(ConnectionState::Connected));
        assert_eq!(map[1].connections, vec![peer(1)]);
        assert_eq!(map[2].state, PeerStatus::Connection(ConnectionState::Initiating));
    }

    #[test]
    fn presence_adds_indirect_peers_and_edges() {
        let (tx, _) = broadcast::channel(1);
        let graph = StaticGraph {
            nodes: vec![peer(1), peer(2), peer(4)],
            links: vec![
                GraphLink { source: peer(2), target: peer(4) },
                GraphLink { source: peer(4), target: peer(2) },
                GraphLink { source: peer(5), target: peer(4) },
            ],
            tx,
        };
        let map = map_peers(peer(1), &[info(2, ConnectionState::Connected)], Some(&graph));

        let ids: Vec<PeerId> = map.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![peer(1), peer(2), peer(4), peer(5)]);
        // Direct entries keep their state; presence only adds edges.
        assert_eq!(map[1].state, PeerStatus::Connection(ConnectionState::Connected));
        assert_eq!(map[1].connections, vec![peer(1), peer(4)]);
        assert_eq!(map[2].state, PeerStatus::IndirectlyConnected);
        assert_eq!(map[2].connections, vec![peer(2)]);
        assert_eq!(map[3].connections, vec![peer(4)]);
    }
}

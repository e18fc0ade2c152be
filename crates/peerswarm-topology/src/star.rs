//! Star topology: every peer keeps exactly one connection, to the hub.

use std::time::Duration;

use peerswarm_protocol::{PeerId, TOPOLOGY_LOOKUP_INTERVAL_SECS};

use crate::scheduler::{Timer, Wakeup};
use crate::{SwarmController, Topology};

/// Routes the whole swarm through one central peer.
///
/// The hub accepts every offer. Everyone else only talks to the hub and
/// drops any other connection it finds itself in.
#[derive(Debug)]
pub struct StarTopology {
    central_peer: PeerId,
    lookup_interval: Duration,
    lookup_timer: Option<Timer>,
}

impl StarTopology {
    pub fn new(central_peer: PeerId) -> Self {
        Self {
            central_peer,
            lookup_interval: Duration::from_secs(TOPOLOGY_LOOKUP_INTERVAL_SECS),
            lookup_timer: None,
        }
    }

    /// Override the periodic candidate refresh interval.
    pub fn with_lookup_interval(mut self, interval: Duration) -> Self {
        self.lookup_interval = interval;
        self
    }

    pub fn central_peer(&self) -> &PeerId {
        &self.central_peer
    }
}

impl Topology for StarTopology {
    fn init(&mut self, controller: &mut dyn SwarmController) {
        if self.lookup_timer.is_some() {
            tracing::warn!("Star topology initialized twice");
            return;
        }
        self.lookup_timer = Some(
            controller
                .scheduler()
                .every(self.lookup_interval, Wakeup::Lookup),
        );
    }

    fn update(&mut self, controller: &mut dyn SwarmController) {
        let state = controller.state();
        if state.own_peer_id != self.central_peer {
            for peer in state.connected {
                if peer != self.central_peer {
                    tracing::debug!(peer = %peer, "Star: dropping non-hub connection");
                    controller.disconnect(peer);
                }
            }
        }
        for peer in state.candidates {
            if peer == self.central_peer {
                tracing::debug!(hub = %peer, "Star: connecting to hub");
                controller.connect(peer);
            }
        }
    }

    fn on_offer(&mut self, peer: &PeerId, controller: &mut dyn SwarmController) -> bool {
        let state = controller.state();
        state.own_peer_id == self.central_peer || *peer == self.central_peer
    }

    fn destroy(&mut self) {
        if let Some(timer) = self.lookup_timer.take() {
            timer.cancel();
        }
    }

    fn name(&self) -> &'static str {
        "star"
    }
}

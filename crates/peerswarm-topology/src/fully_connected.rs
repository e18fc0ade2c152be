use peerswarm_protocol::PeerId;

use crate::{SwarmController, Topology};

/// Connects to every discovered peer and accepts every offer.
#[derive(Debug, Default)]
pub struct FullyConnectedTopology;

impl FullyConnectedTopology {
    pub fn new() -> Self {
        Self
    }
}

impl Topology for FullyConnectedTopology {
    fn init(&mut self, _controller: &mut dyn SwarmController) {}

    fn update(&mut self, controller: &mut dyn SwarmController) {
        let state = controller.state();
        for peer in state.candidates {
            tracing::debug!(peer = %peer, "Fully connected: connecting to candidate");
            controller.connect(peer);
        }
    }

    fn on_offer(&mut self, _peer: &PeerId, _controller: &mut dyn SwarmController) -> bool {
        true
    }

    fn destroy(&mut self) {}

    fn name(&self) -> &'static str {
        "fully-connected"
    }
}

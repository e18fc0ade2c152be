//! peerswarm topology - pluggable peer-selection strategies
//!
//! A topology decides which discovered candidates a swarm connects to, which
//! connections it drops, and which inbound offers it accepts. Three strategies
//! ship with the crate:
//! - `FullyConnectedTopology`: connect to everyone
//! - `StarTopology`: every peer connects to one designated hub
//! - `MmstTopology`: bounded-degree random graph biased towards XOR-near peers
//!
//! Topologies never hold a copy of swarm state. The owning swarm hands them a
//! `SwarmController` on every call, and they query it on demand.

pub mod fully_connected;
pub mod mmst;
pub mod scheduler;
pub mod star;

pub use fully_connected::FullyConnectedTopology;
pub use mmst::{MmstConfig, MmstTopology};
pub use scheduler::{Scheduler, Timer, Wakeup};
pub use star::StarTopology;

use peerswarm_protocol::PeerId;

/// Snapshot of a swarm as seen by its topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmState {
    pub own_peer_id: PeerId,
    /// Peers with a live connection, in any connection state.
    pub connected: Vec<PeerId>,
    /// Discovered peers that are not connected.
    pub candidates: Vec<PeerId>,
}

/// Capability a swarm exposes to its topology.
pub trait SwarmController {
    /// Current connected and candidate sets.
    fn state(&self) -> SwarmState;

    /// Start an outbound connection. No-op if the peer is already connected.
    fn connect(&mut self, peer: PeerId);

    /// Close and forget the connection to `peer`, then re-run the topology.
    fn disconnect(&mut self, peer: PeerId);

    /// Ask the signaling layer for a fresh candidate list.
    fn lookup(&mut self);

    /// Timer capability whose wakeups are delivered back to this swarm.
    fn scheduler(&self) -> Scheduler;
}

/// Peer-selection policy bound to exactly one swarm.
pub trait Topology: Send {
    /// Called once when the topology is installed into a swarm.
    fn init(&mut self, controller: &mut dyn SwarmController);

    /// Called whenever candidate or connection state may have changed.
    fn update(&mut self, controller: &mut dyn SwarmController);

    /// Decide whether to accept an inbound connection request from `peer`.
    fn on_offer(&mut self, peer: &PeerId, controller: &mut dyn SwarmController) -> bool;

    /// Cancel every pending timer. Called before the swarm releases connections.
    fn destroy(&mut self);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

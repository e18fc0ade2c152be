//! peerswarm network - per-topic swarms and the node-level network manager
//!
//! Ties the other crates together:
//! - `Swarm` / `SwarmHandle`: one actor per topic owning connections and the topology
//! - `Connection`: one negotiated session with a remote peer
//! - `SwarmMapper`: peer-state projection for presentation layers
//! - `NetworkManager`: topic registry and routing of rendezvous traffic
//! - `MemoryTransport`: in-process transport for tests and local runs

pub mod config;
pub mod connection;
pub mod logging;
pub mod manager;
pub mod mapper;
pub mod memory;
pub mod relay;
pub mod swarm;
pub mod transport;

pub use config::{LoggingConfig, NetworkConfig, SignalConfig, TopologyConfig, TopologyKind};
pub use connection::{Connection, ConnectionState};
pub use manager::{NetworkManager, SwarmOptions};
pub use mapper::{map_peers, GraphLink, GraphSource, PeerState, PeerStatus, SwarmMapper};
pub use memory::{MemoryTransport, MemoryTransportRegistry};
pub use relay::SignalRelay;
pub use swarm::{ConnectionInfo, Swarm, SwarmEvent, SwarmHandle, SwarmParams};
pub use transport::{
    AsyncStream, ByteStream, ConnectionEvent, ProtocolContext, ProtocolProvider, TransportEvent,
    TransportEvents, TransportFactory, TransportOptions, TransportSession,
};

use peerswarm_protocol::Topic;
use thiserror::Error;

/// Errors originating from the network layer.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Already joined swarm {0}")]
    AlreadyJoined(Topic),

    #[error("Not joined to swarm {0}")]
    NotJoined(Topic),

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signal error: {0}")]
    Signal(#[from] peerswarm_signal::SignalError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] peerswarm_protocol::ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

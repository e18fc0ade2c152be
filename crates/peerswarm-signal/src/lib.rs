//! peerswarm signal - rendezvous clients and multi-server reconciliation
//!
//! Talks to one or more rendezvous ("signal") servers on behalf of every
//! swarm on this node:
//! - `SignalClient`: one server, lazy connect, per-call timeout, command traces
//! - `SignalManager`: desired-membership reconciliation across every server,
//!   candidate aggregation, offer fan-out and duplicate-signal suppression
//! - `TcpRpcConnector`: newline-delimited JSON-RPC 2.0 over TCP
//! - `MemoryRendezvous`: in-process rendezvous server for tests and local runs

pub mod client;
pub mod handler;
pub mod manager;
pub mod memory;
pub mod rpc;
pub mod tcp;

pub use client::{CommandTrace, SignalClient, SignalState, SignalStatus};
pub use handler::SignalHandler;
pub use manager::{SignalManager, SignalOptions};
pub use memory::{MemoryConnector, MemoryRendezvous};
pub use rpc::{RpcConnector, RpcEvent, RpcReply, RpcTransport};
pub use tcp::TcpRpcConnector;

use thiserror::Error;

/// Errors originating from the signaling layer.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("RPC call `{method}` timed out after {ms} ms")]
    Timeout { method: String, ms: u64 },

    #[error("Not connected to signal server: {0}")]
    NotConnected(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Failed to connect to signal server: {0}")]
    Connect(String),

    #[error("Offer failed on every signal server")]
    OfferFailed,

    #[error("No signal servers configured")]
    NoServers,

    #[error("Protocol error: {0}")]
    Protocol(#[from] peerswarm_protocol::ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<peerswarm_protocol::RpcError> for SignalError {
    fn from(e: peerswarm_protocol::RpcError) -> Self {
        SignalError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

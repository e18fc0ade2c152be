//! Bidirectional RPC channel to one rendezvous server.
//!
//! The signal client does not care how bytes reach the server. A connector
//! opens a channel and hands back an `RpcTransport` for outbound calls;
//! everything the server pushes (requests, notifications, link state) comes
//! back as `RpcEvent`s on the sender given to `connect`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use peerswarm_protocol::RpcError;

use crate::SignalError;

/// Reply slot for a server-initiated request.
pub type RpcReply = oneshot::Sender<Result<serde_json::Value, RpcError>>;

/// Something the server pushed to us, or a change in link state.
#[derive(Debug)]
pub enum RpcEvent {
    Connected,
    Disconnected,
    Error(String),
    /// Server-initiated call. The answer must be sent through `reply`.
    Request {
        method: String,
        params: serde_json::Value,
        reply: RpcReply,
    },
    Notification {
        method: String,
        params: serde_json::Value,
    },
}

/// Outbound half of an open channel.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Call `method` and wait for its result.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SignalError>;

    /// Fire-and-forget notification.
    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), SignalError>;

    /// Tear the channel down. Idempotent.
    async fn close(&self);
}

/// Opens channels to rendezvous servers by host name.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        events: mpsc::UnboundedSender<RpcEvent>,
    ) -> Result<Arc<dyn RpcTransport>, SignalError>;
}

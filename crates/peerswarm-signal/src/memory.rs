//! In-process rendezvous server.
//!
//! Implements the full signal RPC surface (join, leave, lookup, offer,
//! signal) over channels, so swarms can be exercised end-to-end without a
//! network. Each `MemoryRendezvous` is one independent server; a
//! `MemoryConnector` maps host names to servers, which makes multi-server
//! setups easy to build.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use peerswarm_protocol::{
    LookupParams, MembershipParams, PeerId, SignalMessage, SignalMethod, Topic,
};

use crate::rpc::{RpcConnector, RpcEvent, RpcTransport};
use crate::SignalError;

/// Error code returned when an offer targets a peer the server does not know.
pub const PEER_NOT_FOUND: i32 = -32004;

/// One in-memory rendezvous server. Clones share the same server.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    inner: Arc<Mutex<RendezvousState>>,
}

#[derive(Default)]
struct RendezvousState {
    next_conn: u64,
    offline: bool,
    connections: HashMap<u64, mpsc::UnboundedSender<RpcEvent>>,
    /// Members of each topic and the channel they joined through.
    members: HashMap<Topic, BTreeMap<PeerId, u64>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RendezvousState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Peers currently joined to `topic`, in key order.
    pub fn peers(&self, topic: &Topic) -> Vec<PeerId> {
        self.state()
            .members
            .get(topic)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of open client channels.
    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Take the server down or bring it back.
    ///
    /// Going offline drops every channel (clients see `Disconnected`) and
    /// forgets all memberships. While offline, connects and calls fail.
    pub fn set_online(&self, online: bool) {
        let dropped = {
            let mut state = self.state();
            state.offline = !online;
            if online {
                Vec::new()
            } else {
                state.members.clear();
                state.connections.drain().map(|(_, tx)| tx).collect()
            }
        };
        for tx in dropped {
            let _ = tx.send(RpcEvent::Disconnected);
        }
        tracing::debug!(online, "Memory rendezvous availability changed");
    }

    fn open(&self, events: mpsc::UnboundedSender<RpcEvent>) -> Result<u64, SignalError> {
        let mut state = self.state();
        if state.offline {
            return Err(SignalError::Connect("rendezvous offline".into()));
        }
        state.next_conn += 1;
        let id = state.next_conn;
        let _ = events.send(RpcEvent::Connected);
        state.connections.insert(id, events);
        Ok(id)
    }

    fn close_connection(&self, conn: u64) {
        let mut state = self.state();
        state.connections.remove(&conn);
        for members in state.members.values_mut() {
            members.retain(|_, c| *c != conn);
        }
        state.members.retain(|_, m| !m.is_empty());
    }

    fn check_open(&self, conn: u64) -> Result<(), SignalError> {
        if self.state().connections.contains_key(&conn) {
            Ok(())
        } else {
            Err(SignalError::NotConnected("memory rendezvous".into()))
        }
    }

    /// Channel of the peer `recipient` joined `topic` through.
    fn route(&self, topic: &Topic, recipient: &PeerId) -> Option<mpsc::UnboundedSender<RpcEvent>> {
        let state = self.state();
        let conn = state.members.get(topic)?.get(recipient)?;
        state.connections.get(conn).cloned()
    }

    async fn handle_call(
        &self,
        conn: u64,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SignalError> {
        self.check_open(conn)?;
        let method = SignalMethod::from_name(method).ok_or_else(|| SignalError::Rpc {
            code: -32601,
            message: format!("Unknown method: {}", method),
        })?;

        match method {
            SignalMethod::Join => {
                let p: MembershipParams = serde_json::from_value(params)?;
                let peers = {
                    let mut state = self.state();
                    let members = state.members.entry(p.topic).or_default();
                    members.insert(p.peer_id, conn);
                    members.keys().copied().collect::<Vec<_>>()
                };
                tracing::debug!(topic = %p.topic, peer = %p.peer_id, "Rendezvous: join");
                Ok(serde_json::to_value(peers)?)
            }
            SignalMethod::Leave => {
                let p: MembershipParams = serde_json::from_value(params)?;
                let mut state = self.state();
                if let Some(members) = state.members.get_mut(&p.topic) {
                    if members.get(&p.peer_id) == Some(&conn) {
                        members.remove(&p.peer_id);
                    }
                    if members.is_empty() {
                        state.members.remove(&p.topic);
                    }
                }
                Ok(serde_json::Value::Null)
            }
            SignalMethod::Lookup => {
                let p: LookupParams = serde_json::from_value(params)?;
                Ok(serde_json::to_value(self.peers(&p.topic))?)
            }
            SignalMethod::Offer => {
                let message: SignalMessage = serde_json::from_value(params.clone())?;
                let target = self
                    .route(&message.topic, &message.recipient_id)
                    .ok_or_else(|| SignalError::Rpc {
                        code: PEER_NOT_FOUND,
                        message: format!("Peer not found: {}", message.recipient_id),
                    })?;
                let (reply_tx, reply_rx) = oneshot::channel();
                target
                    .send(RpcEvent::Request {
                        method: SignalMethod::Offer.to_string(),
                        params,
                        reply: reply_tx,
                    })
                    .map_err(|_| SignalError::ChannelClosed)?;
                match reply_rx.await {
                    Ok(Ok(answer)) => Ok(answer),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(SignalError::ChannelClosed),
                }
            }
            SignalMethod::Signal => {
                self.handle_notify(conn, SignalMethod::Signal.as_str(), params)?;
                Ok(serde_json::Value::Null)
            }
        }
    }

    fn handle_notify(
        &self,
        conn: u64,
        method: &str,
        params: serde_json::Value,
    ) -> Result<(), SignalError> {
        self.check_open(conn)?;
        if SignalMethod::from_name(method) != Some(SignalMethod::Signal) {
            return Ok(());
        }
        let message: SignalMessage = serde_json::from_value(params.clone())?;
        match self.route(&message.topic, &message.recipient_id) {
            Some(target) => {
                let _ = target.send(RpcEvent::Notification {
                    method: method.to_string(),
                    params,
                });
            }
            None => {
                tracing::debug!(recipient = %message.recipient_id, "Rendezvous: signal for unknown peer dropped");
            }
        }
        Ok(())
    }
}

/// Client channel into a `MemoryRendezvous`.
struct MemoryRpcTransport {
    server: MemoryRendezvous,
    conn: u64,
}

#[async_trait]
impl RpcTransport for MemoryRpcTransport {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SignalError> {
        self.server.handle_call(self.conn, method, params).await
    }

    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), SignalError> {
        self.server.handle_notify(self.conn, method, params)
    }

    async fn close(&self) {
        self.server.close_connection(self.conn);
    }
}

/// Resolves host names to in-memory rendezvous servers.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    servers: HashMap<String, MemoryRendezvous>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `server` under `host`.
    pub fn with_server(mut self, host: impl Into<String>, server: MemoryRendezvous) -> Self {
        self.servers.insert(host.into(), server);
        self
    }

    /// Every registered host name, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.servers.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

#[async_trait]
impl RpcConnector for MemoryConnector {
    async fn connect(
        &self,
        host: &str,
        events: mpsc::UnboundedSender<RpcEvent>,
    ) -> Result<Arc<dyn RpcTransport>, SignalError> {
        let server = self
            .servers
            .get(host)
            .ok_or_else(|| SignalError::Connect(format!("unknown host {}", host)))?;
        let conn = server.open(events)?;
        Ok(Arc::new(MemoryRpcTransport {
            server: server.clone(),
            conn,
        }))
    }
}

//! Client for a single rendezvous server.
//!
//! The client connects lazily on its first call and reconnects on the next
//! call after the channel reported an error or went away. Every call is
//! bounded by the RPC timeout and produces a `CommandTrace`.
//!
//! Inbound traffic is routed to a `SignalHandler`: offers are answered on
//! their own task, signals are delivered one at a time in arrival order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use peerswarm_protocol::{
    Answer, LookupParams, MembershipParams, PeerId, RpcError, SignalMessage, SignalMethod, Topic,
    RPC_TIMEOUT_MS,
};

use crate::handler::SignalHandler;
use crate::rpc::{RpcConnector, RpcEvent, RpcReply, RpcTransport};
use crate::SignalError;

const STATUS_CHANNEL_CAPACITY: usize = 64;
const TRACE_CHANNEL_CAPACITY: usize = 256;

/// Link state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    NotConnected,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalStatus {
    pub host: String,
    pub state: SignalState,
    /// Last error reported by the channel, cleared on state change.
    pub error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Record of one RPC issued to a rendezvous server.
#[derive(Debug, Clone, Serialize)]
pub struct CommandTrace {
    pub id: Uuid,
    pub host: String,
    pub time: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub method: String,
    pub payload: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Handle to one rendezvous server. Cheap to clone.
#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    host: String,
    connector: Arc<dyn RpcConnector>,
    handler: Arc<dyn SignalHandler>,
    timeout: Duration,
    /// Held across connect so concurrent callers share one attempt.
    transport: tokio::sync::Mutex<Option<Arc<dyn RpcTransport>>>,
    status: Mutex<SignalStatus>,
    status_tx: broadcast::Sender<SignalStatus>,
    trace_tx: broadcast::Sender<CommandTrace>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SignalClient {
    /// Client with the default RPC timeout and its own trace stream.
    pub fn new(
        host: impl Into<String>,
        connector: Arc<dyn RpcConnector>,
        handler: Arc<dyn SignalHandler>,
    ) -> Self {
        let (trace_tx, _) = broadcast::channel(TRACE_CHANNEL_CAPACITY);
        Self::with_options(
            host,
            connector,
            handler,
            Duration::from_millis(RPC_TIMEOUT_MS),
            trace_tx,
        )
    }

    /// Client with an explicit timeout, publishing traces on `traces`.
    pub fn with_options(
        host: impl Into<String>,
        connector: Arc<dyn RpcConnector>,
        handler: Arc<dyn SignalHandler>,
        timeout: Duration,
        traces: broadcast::Sender<CommandTrace>,
    ) -> Self {
        let host = host.into();
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                status: Mutex::new(SignalStatus {
                    host: host.clone(),
                    state: SignalState::NotConnected,
                    error: None,
                    connected_at: None,
                }),
                host,
                connector,
                handler,
                timeout,
                transport: tokio::sync::Mutex::new(None),
                status_tx,
                trace_tx: traces,
                event_task: Mutex::new(None),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn status(&self) -> SignalStatus {
        lock(&self.inner.status).clone()
    }

    pub fn state(&self) -> SignalState {
        self.inner.state()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SignalStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_traces(&self) -> broadcast::Receiver<CommandTrace> {
        self.inner.trace_tx.subscribe()
    }

    /// Open the channel now instead of on the first call.
    pub async fn connect(&self) -> Result<(), SignalError> {
        let timeout = self.inner.timeout;
        match tokio::time::timeout(timeout, self.transport()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                let e = SignalError::Timeout {
                    method: "connect".into(),
                    ms: timeout.as_millis() as u64,
                };
                self.inner.abandon_connecting(&e);
                Err(e)
            }
        }
    }

    /// Close the channel. A later call reconnects.
    pub async fn close(&self) {
        let transport = self.inner.transport.lock().await.take();
        if let Some(task) = lock(&self.inner.event_task).take() {
            task.abort();
        }
        if let Some(transport) = transport {
            transport.close().await;
            self.inner.set_state(SignalState::Disconnected, None);
        }
    }

    /// Announce `peer_id` under `topic`. Returns the peers currently in the topic.
    pub async fn join(&self, topic: Topic, peer_id: PeerId) -> Result<Vec<PeerId>, SignalError> {
        let params = serde_json::to_value(MembershipParams { peer_id, topic })?;
        let result = self.execute(SignalMethod::Join, params).await?;
        peers_from(result)
    }

    pub async fn leave(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError> {
        let params = serde_json::to_value(MembershipParams { peer_id, topic })?;
        self.execute(SignalMethod::Leave, params).await?;
        Ok(())
    }

    pub async fn lookup(&self, topic: Topic) -> Result<Vec<PeerId>, SignalError> {
        let params = serde_json::to_value(LookupParams { topic })?;
        let result = self.execute(SignalMethod::Lookup, params).await?;
        peers_from(result)
    }

    /// Ask the recipient to accept a connection.
    pub async fn offer(&self, message: SignalMessage) -> Result<Answer, SignalError> {
        let params = serde_json::to_value(&message)?;
        let result = self.execute(SignalMethod::Offer, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Relay negotiation data. Sent as a notification.
    pub async fn signal(&self, message: SignalMessage) -> Result<(), SignalError> {
        let params = serde_json::to_value(&message)?;
        self.execute(SignalMethod::Signal, params).await?;
        Ok(())
    }

    async fn transport(&self) -> Result<Arc<dyn RpcTransport>, SignalError> {
        let mut slot = self.inner.transport.lock().await;
        if let Some(existing) = slot.as_ref() {
            if self.inner.state() == SignalState::Connected {
                return Ok(existing.clone());
            }
            existing.close().await;
            *slot = None;
            tracing::debug!(host = %self.inner.host, "Reconnecting to signal server");
        }

        self.inner.set_state(SignalState::Connecting, None);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.inner.connector.connect(&self.inner.host, events_tx).await {
            Ok(transport) => {
                self.inner.set_state(SignalState::Connected, None);
                tracing::info!(host = %self.inner.host, "Connected to signal server");
                let task = tokio::spawn(run_events(
                    Arc::downgrade(&self.inner),
                    self.inner.handler.clone(),
                    events_rx,
                ));
                if let Some(old) = lock(&self.inner.event_task).replace(task) {
                    old.abort();
                }
                *slot = Some(transport.clone());
                Ok(transport)
            }
            Err(e) => {
                tracing::warn!(host = %self.inner.host, error = %e, "Signal server connection failed");
                self.inner.set_state(SignalState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        method: SignalMethod,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, SignalError> {
        let id = Uuid::new_v4();
        let time = Utc::now();
        let started = Instant::now();
        let timeout = self.inner.timeout;

        let attempt = async {
            let transport = self.transport().await?;
            if method == SignalMethod::Signal {
                transport
                    .notify(method.as_str(), params.clone())
                    .await
                    .map(|_| serde_json::Value::Null)
            } else {
                transport.call(method.as_str(), params.clone()).await
            }
        };
        let outcome = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SignalError::Timeout {
                method: method.to_string(),
                ms: timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            Err(
                e @ (SignalError::ChannelClosed | SignalError::Io(_) | SignalError::NotConnected(_)),
            ) => {
                // Channel is unusable, reconnect on the next call.
                self.inner.set_state(SignalState::Error, Some(e.to_string()));
            }
            Err(e @ SignalError::Timeout { .. }) => self.inner.abandon_connecting(e),
            _ => {}
        }

        let trace = CommandTrace {
            id,
            host: self.inner.host.clone(),
            time,
            elapsed_ms: started.elapsed().as_millis() as u64,
            method: method.to_string(),
            payload: params,
            response: outcome.as_ref().ok().cloned(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        if let Some(error) = &trace.error {
            tracing::debug!(host = %trace.host, method = %trace.method, error = %error, "Signal RPC failed");
        }
        let _ = self.inner.trace_tx.send(trace);

        outcome
    }
}

impl std::fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalClient")
            .field("host", &self.inner.host)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ClientInner {
    fn state(&self) -> SignalState {
        lock(&self.status).state
    }

    fn set_state(&self, state: SignalState, error: Option<String>) {
        let snapshot = {
            let mut status = lock(&self.status);
            if status.state == state && status.error == error {
                return;
            }
            status.state = state;
            status.error = error;
            match state {
                SignalState::Connected => status.connected_at = Some(Utc::now()),
                SignalState::Connecting => {}
                _ => status.connected_at = None,
            }
            status.clone()
        };
        tracing::debug!(host = %self.host, state = ?state, "Signal client state changed");
        let _ = self.status_tx.send(snapshot);
    }

    /// A connect attempt that ran out of time leaves no channel behind.
    fn abandon_connecting(&self, e: &SignalError) {
        if self.state() == SignalState::Connecting {
            tracing::warn!(host = %self.host, error = %e, "Signal server connection timed out");
            self.set_state(SignalState::Error, Some(e.to_string()));
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }
    }
}

fn peers_from(result: serde_json::Value) -> Result<Vec<PeerId>, SignalError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(result)?)
}

async fn run_events(
    client: Weak<ClientInner>,
    handler: Arc<dyn SignalHandler>,
    mut events: mpsc::UnboundedReceiver<RpcEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RpcEvent::Connected => {}
            RpcEvent::Disconnected => {
                if let Some(client) = client.upgrade() {
                    tracing::warn!(host = %client.host, "Signal server disconnected");
                    client.set_state(SignalState::Disconnected, None);
                }
            }
            RpcEvent::Error(reason) => {
                if let Some(client) = client.upgrade() {
                    tracing::warn!(host = %client.host, error = %reason, "Signal channel error");
                    client.set_state(SignalState::Error, Some(reason));
                }
            }
            RpcEvent::Request {
                method,
                params,
                reply,
            } => handle_request(&handler, &method, params, reply),
            RpcEvent::Notification { method, params } => {
                handle_notification(&handler, &method, params).await
            }
        }
    }
}

fn handle_request(
    handler: &Arc<dyn SignalHandler>,
    method: &str,
    params: serde_json::Value,
    reply: RpcReply,
) {
    if SignalMethod::from_name(method) != Some(SignalMethod::Offer) {
        let _ = reply.send(Err(rpc_error(-32601, format!("Unknown method: {}", method))));
        return;
    }
    let message: SignalMessage = match serde_json::from_value(params) {
        Ok(m) => m,
        Err(e) => {
            let _ = reply.send(Err(rpc_error(-32602, format!("Invalid offer: {}", e))));
            return;
        }
    };

    // Answering may take a while; keep reading signals meanwhile.
    let handler = handler.clone();
    tokio::spawn(async move {
        let answer = handler.on_offer(message).await;
        let result = serde_json::to_value(answer)
            .map_err(|e| rpc_error(-32603, format!("Internal error: {}", e)));
        let _ = reply.send(result);
    });
}

async fn handle_notification(
    handler: &Arc<dyn SignalHandler>,
    method: &str,
    params: serde_json::Value,
) {
    if SignalMethod::from_name(method) != Some(SignalMethod::Signal) {
        tracing::debug!(method = %method, "Ignoring unknown notification");
        return;
    }
    match serde_json::from_value::<SignalMessage>(params) {
        Ok(message) => handler.on_signal(message).await,
        Err(e) => tracing::warn!(error = %e, "Dropping malformed signal"),
    }
}

fn rpc_error(code: i32, message: String) -> RpcError {
    RpcError {
        code,
        message,
        data: None,
    }
}

//! Multi-server signaling.
//!
//! The manager keeps the set of topics this node wants to be in and drives
//! every rendezvous server towards it. `join` and `leave` only record intent;
//! a single-flight reconciliation pass does the RPC work and retries after a
//! delay until every server agrees. Callers never see those failures.
//!
//! Candidates are tracked per server and handed to the `SignalHandler` as a
//! deduplicated union. Offers race across every server; signals go to all of
//! them, and copies relayed back by more than one server are delivered once.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use peerswarm_protocol::{
    Answer, PeerId, SignalMessage, Topic, RECONCILE_RETRY_MS, RPC_TIMEOUT_MS,
};

use crate::client::{CommandTrace, SignalClient, SignalState, SignalStatus};
use crate::handler::SignalHandler;
use crate::rpc::RpcConnector;
use crate::SignalError;

const TRACE_CHANNEL_CAPACITY: usize = 1024;
const SEEN_SIGNAL_WINDOW: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables of the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalOptions {
    /// Upper bound on every RPC call, connect included.
    pub rpc_timeout: Duration,
    /// Delay before a failed reconciliation pass runs again.
    pub retry_delay: Duration,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(RPC_TIMEOUT_MS),
            retry_delay: Duration::from_millis(RECONCILE_RETRY_MS),
        }
    }
}

/// What one server has confirmed.
#[derive(Debug, Default)]
struct ServerState {
    joined: HashMap<Topic, PeerId>,
    candidates: HashMap<Topic, HashSet<PeerId>>,
}

#[derive(Debug, Default)]
struct ManagerState {
    desired: HashMap<Topic, PeerId>,
    servers: Vec<ServerState>,
    running: bool,
    rerun: bool,
    retry_pending: bool,
    watching: bool,
    closed: bool,
}

impl ManagerState {
    fn union(&self, topic: &Topic) -> Vec<PeerId> {
        let peers: BTreeSet<PeerId> = self
            .servers
            .iter()
            .filter_map(|s| s.candidates.get(topic))
            .flatten()
            .copied()
            .collect();
        peers.into_iter().collect()
    }
}

/// Signal client set shared by every swarm on the node. Cheap to clone.
#[derive(Clone)]
pub struct SignalManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    clients: Vec<SignalClient>,
    state: Mutex<ManagerState>,
    handler: Arc<dyn SignalHandler>,
    retry_delay: Duration,
    trace_tx: broadcast::Sender<CommandTrace>,
}

impl SignalManager {
    pub fn new(
        hosts: Vec<String>,
        connector: Arc<dyn RpcConnector>,
        handler: Arc<dyn SignalHandler>,
    ) -> Self {
        Self::with_options(hosts, connector, handler, SignalOptions::default())
    }

    pub fn with_options(
        hosts: Vec<String>,
        connector: Arc<dyn RpcConnector>,
        handler: Arc<dyn SignalHandler>,
        options: SignalOptions,
    ) -> Self {
        let (trace_tx, _) = broadcast::channel(TRACE_CHANNEL_CAPACITY);
        let inbound: Arc<dyn SignalHandler> = Arc::new(InboundFilter {
            handler: handler.clone(),
            seen: Mutex::new(SeenSignals::default()),
        });
        let clients: Vec<SignalClient> = hosts
            .into_iter()
            .map(|host| {
                SignalClient::with_options(
                    host,
                    connector.clone(),
                    inbound.clone(),
                    options.rpc_timeout,
                    trace_tx.clone(),
                )
            })
            .collect();
        let state = ManagerState {
            servers: clients.iter().map(|_| ServerState::default()).collect(),
            ..Default::default()
        };

        Self {
            inner: Arc::new(ManagerInner {
                clients,
                state: Mutex::new(state),
                handler,
                retry_delay: options.retry_delay,
                trace_tx,
            }),
        }
    }

    /// Connect every client now. Failures are logged; clients retry lazily.
    pub async fn start(&self) {
        self.inner.watch_clients();
        let attempts = self.inner.clients.iter().map(|c| async move {
            if let Err(e) = c.connect().await {
                tracing::warn!(host = %c.host(), error = %e, "Signal server unavailable at startup");
            }
        });
        futures::future::join_all(attempts).await;
    }

    /// Announce `peer_id` under `topic` on every server, eventually.
    pub fn join(&self, topic: Topic, peer_id: PeerId) {
        lock(&self.inner.state).desired.insert(topic, peer_id);
        tracing::debug!(topic = %topic, peer = %peer_id, "Signal join requested");
        self.inner.request_reconcile();
    }

    /// Withdraw from `topic` on every server, eventually.
    pub fn leave(&self, topic: Topic) {
        lock(&self.inner.state).desired.remove(&topic);
        tracing::debug!(topic = %topic, "Signal leave requested");
        self.inner.request_reconcile();
    }

    /// Topics this node wants to be in.
    pub fn desired(&self) -> HashMap<Topic, PeerId> {
        lock(&self.inner.state).desired.clone()
    }

    /// Topics each server has confirmed, indexed like `status()`.
    pub fn joined(&self) -> Vec<HashMap<Topic, PeerId>> {
        lock(&self.inner.state)
            .servers
            .iter()
            .map(|s| s.joined.clone())
            .collect()
    }

    /// Current candidate union for `topic`.
    pub fn candidates(&self, topic: &Topic) -> Vec<PeerId> {
        lock(&self.inner.state).union(topic)
    }

    /// Refresh candidates for `topic` from every server.
    pub async fn lookup(&self, topic: Topic) -> Result<Vec<PeerId>, SignalError> {
        if self.inner.clients.is_empty() {
            return Err(SignalError::NoServers);
        }
        let results = futures::future::join_all(
            self.inner.clients.iter().map(|c| c.lookup(topic)),
        )
        .await;

        let mut answered = false;
        let union = {
            let mut state = lock(&self.inner.state);
            for (server, result) in state.servers.iter_mut().zip(results) {
                match result {
                    Ok(peers) => {
                        answered = true;
                        server.candidates.insert(topic, peers.into_iter().collect());
                    }
                    Err(e) => tracing::debug!(topic = %topic, error = %e, "Lookup failed on one server"),
                }
            }
            state.union(&topic)
        };
        if !answered {
            return Err(SignalError::NotConnected("every signal server".into()));
        }
        self.inner.handler.on_candidates_changed(topic, union.clone());
        Ok(union)
    }

    /// Offer a connection through every server; the first acceptance wins.
    pub async fn offer(&self, message: SignalMessage) -> Result<Answer, SignalError> {
        if self.inner.clients.is_empty() {
            return Err(SignalError::NoServers);
        }
        let mut pending: FuturesUnordered<_> = self
            .inner
            .clients
            .iter()
            .map(|c| c.offer(message.clone()))
            .collect();

        let mut answered = false;
        while let Some(result) = pending.next().await {
            match result {
                Ok(answer) if answer.accept => return Ok(answer),
                Ok(_) => answered = true,
                Err(e) => tracing::debug!(
                    recipient = %message.recipient_id,
                    error = %e,
                    "Offer failed on one server"
                ),
            }
        }
        if answered {
            Ok(Answer::REJECT)
        } else {
            Err(SignalError::OfferFailed)
        }
    }

    /// Relay `message` through every server. Best effort.
    pub async fn signal(&self, message: SignalMessage) {
        let sends = self.inner.clients.iter().map(|c| {
            let message = message.clone();
            async move {
                if let Err(e) = c.signal(message).await {
                    tracing::debug!(host = %c.host(), error = %e, "Signal relay failed");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    pub fn status(&self) -> Vec<SignalStatus> {
        self.inner.clients.iter().map(|c| c.status()).collect()
    }

    /// Command traces of every client, merged.
    pub fn subscribe_traces(&self) -> broadcast::Receiver<CommandTrace> {
        self.inner.trace_tx.subscribe()
    }

    pub fn clients(&self) -> &[SignalClient] {
        &self.inner.clients
    }

    /// Stop reconciling and close every client.
    pub async fn close(&self) {
        lock(&self.inner.state).closed = true;
        for client in &self.inner.clients {
            client.close().await;
        }
        tracing::info!("Signal manager closed");
    }
}

impl ManagerInner {
    /// Forget what a server confirmed once its channel drops, so the next
    /// pass joins again. Started once, on first use.
    fn watch_clients(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.watching {
                return;
            }
            state.watching = true;
        }
        for (index, client) in self.clients.iter().enumerate() {
            let mut status = client.subscribe_status();
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                loop {
                    match status.recv().await {
                        Ok(s) if matches!(s.state, SignalState::Disconnected | SignalState::Error) => {
                            let Some(inner) = weak.upgrade() else { break };
                            let had_joins = {
                                let mut state = lock(&inner.state);
                                let server = &mut state.servers[index];
                                let had_joins = !server.joined.is_empty();
                                server.joined.clear();
                                server.candidates.clear();
                                had_joins
                            };
                            if had_joins {
                                tracing::info!(host = %s.host, "Signal server lost, rejoining topics");
                                inner.request_reconcile();
                            }
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }
    }

    fn request_reconcile(self: &Arc<Self>) {
        self.watch_clients();
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if state.running {
                state.rerun = true;
                return;
            }
            state.running = true;
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.reconcile_loop().await });
    }

    async fn reconcile_loop(self: Arc<Self>) {
        loop {
            let passes = (0..self.clients.len()).map(|i| self.reconcile_server(i));
            let ok = futures::future::join_all(passes).await.into_iter().all(|ok| ok);
            if !ok {
                self.schedule_retry();
            }

            let again = {
                let mut state = lock(&self.state);
                let again = state.rerun && !state.closed;
                state.rerun = false;
                state.running = again;
                again
            };
            if !again {
                break;
            }
        }
    }

    /// Bring one server in line with `desired`. Returns false on any failure.
    async fn reconcile_server(&self, index: usize) -> bool {
        let client = &self.clients[index];
        let (to_leave, to_join) = {
            let state = lock(&self.state);
            let server = &state.servers[index];
            let to_leave: Vec<(Topic, PeerId)> = server
                .joined
                .iter()
                .filter(|&(topic, peer)| state.desired.get(topic) != Some(peer))
                .map(|(t, p)| (*t, *p))
                .collect();
            let to_join: Vec<(Topic, PeerId)> = state
                .desired
                .iter()
                .filter(|&(topic, peer)| server.joined.get(topic) != Some(peer))
                .map(|(t, p)| (*t, *p))
                .collect();
            (to_leave, to_join)
        };

        let mut ok = true;
        for (topic, peer) in to_leave {
            match client.leave(topic, peer).await {
                Ok(()) => {
                    tracing::debug!(host = %client.host(), topic = %topic, "Left topic");
                    let mut state = lock(&self.state);
                    let server = &mut state.servers[index];
                    server.joined.remove(&topic);
                    server.candidates.remove(&topic);
                }
                Err(e) => {
                    tracing::warn!(host = %client.host(), topic = %topic, error = %e, "Leave failed");
                    ok = false;
                }
            }
        }

        for (topic, peer) in to_join {
            match client.join(topic, peer).await {
                Ok(peers) => {
                    tracing::debug!(
                        host = %client.host(),
                        topic = %topic,
                        candidates = peers.len(),
                        "Joined topic"
                    );
                    let union = {
                        let mut state = lock(&self.state);
                        let server = &mut state.servers[index];
                        server.joined.insert(topic, peer);
                        server.candidates.insert(topic, peers.into_iter().collect());
                        // A leave that raced this join is handled by the follow-up pass.
                        (state.desired.get(&topic) == Some(&peer)).then(|| state.union(&topic))
                    };
                    if let Some(union) = union {
                        self.handler.on_candidates_changed(topic, union);
                    }
                }
                Err(e) => {
                    tracing::warn!(host = %client.host(), topic = %topic, error = %e, "Join failed");
                    ok = false;
                }
            }
        }
        ok
    }

    fn schedule_retry(self: &Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if state.retry_pending || state.closed {
                return;
            }
            state.retry_pending = true;
        }
        tracing::debug!(delay_ms = self.retry_delay.as_millis() as u64, "Scheduling reconciliation retry");
        let weak = Arc::downgrade(self);
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                lock(&inner.state).retry_pending = false;
                inner.request_reconcile();
            }
        });
    }
}

/// Bounded memory of recently delivered signals.
#[derive(Default)]
struct SeenSignals {
    order: VecDeque<[u8; 32]>,
    set: HashSet<[u8; 32]>,
}

impl SeenSignals {
    /// Record `digest`. Returns false if it was already present.
    fn insert(&mut self, digest: [u8; 32]) -> bool {
        if !self.set.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        if self.order.len() > SEEN_SIGNAL_WINDOW {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

/// Sits between the clients and the real handler; drops relayed duplicates.
struct InboundFilter {
    handler: Arc<dyn SignalHandler>,
    seen: Mutex<SeenSignals>,
}

#[async_trait]
impl SignalHandler for InboundFilter {
    async fn on_offer(&self, message: SignalMessage) -> Answer {
        self.handler.on_offer(message).await
    }

    async fn on_signal(&self, message: SignalMessage) {
        let digest: [u8; 32] = match serde_json::to_vec(&message) {
            Ok(bytes) => Sha256::digest(&bytes).into(),
            Err(e) => {
                tracing::warn!(error = %e, "Unserializable signal dropped");
                return;
            }
        };
        if !lock(&self.seen).insert(digest) {
            tracing::trace!(sender = %message.sender_id, "Duplicate signal suppressed");
            return;
        }
        self.handler.on_signal(message).await;
    }

    fn on_candidates_changed(&self, topic: Topic, candidates: Vec<PeerId>) {
        self.handler.on_candidates_changed(topic, candidates);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_signals_window_is_bounded() {
        let mut seen = SeenSignals::default();
        for i in 0..(SEEN_SIGNAL_WINDOW + 10) {
            let mut digest = [0u8; 32];
            digest[..8].copy_from_slice(&(i as u64).to_be_bytes());
            assert!(seen.insert(digest));
        }
        assert_eq!(seen.order.len(), SEEN_SIGNAL_WINDOW);
        assert_eq!(seen.set.len(), SEEN_SIGNAL_WINDOW);

        // The oldest entries were evicted and count as new again.
        assert!(seen.insert([0u8; 32]));
        let mut recent = [0u8; 32];
        recent[..8].copy_from_slice(&((SEEN_SIGNAL_WINDOW + 9) as u64).to_be_bytes());
        assert!(!seen.insert(recent));
    }

    #[test]
    fn test_union_deduplicates_servers() {
        let topic = Topic::random();
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();
        let mut state = ManagerState::default();
        let mut s1 = ServerState::default();
        s1.candidates.insert(topic, [a, b].into_iter().collect());
        let mut s2 = ServerState::default();
        s2.candidates.insert(topic, [b, c].into_iter().collect());
        state.servers = vec![s1, s2];

        let union = state.union(&topic);
        assert_eq!(union.len(), 3);
        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(union, expected);
    }
}

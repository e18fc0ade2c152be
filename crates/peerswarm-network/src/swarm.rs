//! Per-topic swarm actor.
//!
//! Architecture:
//! - `Swarm` owns the connections, the discovered candidates and the topology
//!   of one topic, and runs its event loop in a tokio task.
//! - `SwarmHandle` is a cheaply cloneable handle used by the network manager
//!   to feed rendezvous traffic in and by callers to observe the swarm.
//! - Offers, transport events and topology timers all re-enter the loop as
//!   messages, so state is only ever touched from the swarm's own task.
//!
//! The topology is handed a `SwarmController` on every call. Updates it
//! requests while running (directly or through `disconnect`) are coalesced
//! and replayed once the current call has returned.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use peerswarm_protocol::{Answer, PeerId, SessionId, SignalMessage, SignalPayload, Topic};
use peerswarm_topology::{Scheduler, SwarmController, SwarmState, Topology, Wakeup};

use crate::connection::{Connection, ConnectionState};
use crate::relay::SignalRelay;
use crate::transport::{ConnectionEvent, ProtocolProvider, TransportEvent, TransportFactory, TransportOptions};
use crate::NetworkError;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;
/// Topology re-runs allowed per handled event before giving up until the next one.
const MAX_UPDATE_PASSES: usize = 16;

// ---------------------------------------------------------------------------
// Events emitted to observers
// ---------------------------------------------------------------------------

/// Public view of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub remote_id: PeerId,
    pub session_id: SessionId,
    pub initiator: bool,
    pub state: ConnectionState,
}

impl From<&Connection> for ConnectionInfo {
    fn from(c: &Connection) -> Self {
        Self {
            remote_id: c.remote_id(),
            session_id: c.session_id(),
            initiator: c.initiator(),
            state: c.state(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    ConnectionAdded(ConnectionInfo),
    ConnectionRemoved(PeerId),
    StateChanged { peer: PeerId, state: ConnectionState },
    /// The transport to `peer` came up.
    Connected(PeerId),
}

// ---------------------------------------------------------------------------
// Commands from handles to the swarm
// ---------------------------------------------------------------------------

enum SwarmCommand {
    Offer {
        message: SignalMessage,
        reply: oneshot::Sender<Result<Answer, NetworkError>>,
    },
    Signal {
        message: SignalMessage,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    SetTopology {
        topology: Box<dyn Topology>,
        reply: oneshot::Sender<()>,
    },
    GetConnections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    GetCandidates {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Messages the swarm sends itself from spawned tasks.
enum Internal {
    OfferAnswered {
        remote_id: PeerId,
        session_id: SessionId,
        result: Result<Answer, NetworkError>,
    },
}

// ---------------------------------------------------------------------------
// SwarmHandle
// ---------------------------------------------------------------------------

/// Handle to a running swarm. Dropping every handle shuts the swarm down.
#[derive(Clone)]
pub struct SwarmHandle {
    topic: Topic,
    own_peer_id: PeerId,
    command_tx: mpsc::Sender<SwarmCommand>,
    candidates_tx: Arc<watch::Sender<Vec<PeerId>>>,
    event_tx: broadcast::Sender<SwarmEvent>,
    connections_rx: watch::Receiver<Vec<ConnectionInfo>>,
}

impl SwarmHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn own_peer_id(&self) -> PeerId {
        self.own_peer_id
    }

    /// Whether the swarm task has exited.
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    async fn send(&self, command: SwarmCommand) -> Result<(), NetworkError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| NetworkError::ChannelClosed)
    }

    /// Replace the discovered candidate set.
    ///
    /// Applied before any command sent after this returns.
    pub async fn on_candidates_changed(&self, candidates: Vec<PeerId>) -> Result<(), NetworkError> {
        self.post_candidates(candidates)
    }

    /// Like `on_candidates_changed`, for callers that cannot await.
    ///
    /// Lists posted faster than the swarm consumes them collapse into the
    /// latest one.
    pub fn post_candidates(&self, candidates: Vec<PeerId>) -> Result<(), NetworkError> {
        self.candidates_tx
            .send(candidates)
            .map_err(|_| NetworkError::ChannelClosed)
    }

    /// Decide on an inbound connection request.
    pub async fn on_offer(&self, message: SignalMessage) -> Result<Answer, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(SwarmCommand::Offer { message, reply: tx }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Route negotiation data to its connection.
    pub async fn on_signal(&self, message: SignalMessage) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(SwarmCommand::Signal { message, reply: tx }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)?
    }

    /// Swap the topology. The old one is destroyed first.
    pub async fn set_topology(&self, topology: Box<dyn Topology>) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(SwarmCommand::SetTopology { topology, reply: tx }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(SwarmCommand::GetConnections { reply: tx }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }

    /// Discovered peers without a connection.
    pub async fn candidates(&self) -> Result<Vec<PeerId>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(SwarmCommand::GetCandidates { reply: tx }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }

    /// Stop the topology, close every connection and exit the swarm task.
    pub async fn destroy(&self) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.send(SwarmCommand::Destroy { reply: tx }).await?;
        rx.await.map_err(|_| NetworkError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.event_tx.subscribe()
    }

    /// Connection list, updated on every change.
    pub fn watch_connections(&self) -> watch::Receiver<Vec<ConnectionInfo>> {
        self.connections_rx.clone()
    }
}

impl std::fmt::Debug for SwarmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmHandle")
            .field("topic", &self.topic)
            .field("own_peer_id", &self.own_peer_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Swarm
// ---------------------------------------------------------------------------

/// Everything a swarm is built from.
pub struct SwarmParams {
    pub topic: Topic,
    pub own_peer_id: PeerId,
    pub topology: Box<dyn Topology>,
    pub relay: Arc<dyn SignalRelay>,
    pub transport: Arc<dyn TransportFactory>,
    pub protocol: Option<Arc<dyn ProtocolProvider>>,
}

/// The swarm task. Create with `Swarm::new`, then drive with `run`.
pub struct Swarm {
    core: SwarmCore,
    topology: Box<dyn Topology>,
    command_rx: mpsc::Receiver<SwarmCommand>,
    candidates_rx: watch::Receiver<Vec<PeerId>>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    wakeup_rx: mpsc::UnboundedReceiver<Wakeup>,
}

/// Swarm state the topology may see and act on.
struct SwarmCore {
    topic: Topic,
    own_peer_id: PeerId,
    relay: Arc<dyn SignalRelay>,
    transport: Arc<dyn TransportFactory>,
    protocol: Option<Arc<dyn ProtocolProvider>>,
    connections: HashMap<PeerId, Connection>,
    discovered: HashSet<PeerId>,
    scheduler: Scheduler,
    internal_tx: mpsc::UnboundedSender<Internal>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_tx: broadcast::Sender<SwarmEvent>,
    connections_tx: watch::Sender<Vec<ConnectionInfo>>,
    update_requested: bool,
}

impl Swarm {
    pub fn new(params: SwarmParams) -> (Self, SwarmHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (candidates_tx, candidates_rx) = watch::channel(Vec::new());
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (scheduler, wakeup_rx) = Scheduler::channel();
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (connections_tx, connections_rx) = watch::channel(Vec::new());

        let handle = SwarmHandle {
            topic: params.topic,
            own_peer_id: params.own_peer_id,
            command_tx,
            candidates_tx: Arc::new(candidates_tx),
            event_tx: event_tx.clone(),
            connections_rx,
        };

        let swarm = Self {
            core: SwarmCore {
                topic: params.topic,
                own_peer_id: params.own_peer_id,
                relay: params.relay,
                transport: params.transport,
                protocol: params.protocol,
                connections: HashMap::new(),
                discovered: HashSet::new(),
                scheduler,
                internal_tx,
                connection_tx,
                event_tx,
                connections_tx,
                update_requested: false,
            },
            topology: params.topology,
            command_rx,
            candidates_rx,
            internal_rx,
            connection_rx,
            wakeup_rx,
        };
        (swarm, handle)
    }

    /// Build the swarm and run it on a new task.
    pub fn spawn(params: SwarmParams) -> SwarmHandle {
        let (swarm, handle) = Self::new(params);
        tokio::spawn(swarm.run());
        handle
    }

    /// Run the event loop until destroyed or every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(
            topic = %self.core.topic,
            peer = %self.core.own_peer_id,
            topology = self.topology.name(),
            "Swarm started"
        );
        self.topology.init(&mut self.core);
        self.core.request_update();
        self.run_updates();

        let mut destroy_reply = None;
        loop {
            tokio::select! {
                // Candidates first, so commands sent after a candidate
                // update observe it.
                biased;

                Ok(()) = self.candidates_rx.changed() => {
                    let candidates = self.candidates_rx.borrow_and_update().clone();
                    self.set_candidates(candidates);
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(SwarmCommand::Destroy { reply }) => {
                            destroy_reply = Some(reply);
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            tracing::debug!(topic = %self.core.topic, "All swarm handles dropped");
                            break;
                        }
                    }
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal);
                }
                Some(event) = self.connection_rx.recv() => {
                    self.handle_connection_event(event);
                }
                Some(wakeup) = self.wakeup_rx.recv() => {
                    self.handle_wakeup(wakeup);
                }
            }
            self.run_updates();
        }

        self.shutdown().await;
        if let Some(reply) = destroy_reply {
            let _ = reply.send(());
        }
    }

    /// Run the topology until it stops asking for another pass.
    fn run_updates(&mut self) {
        let mut passes = 0;
        while self.core.update_requested {
            self.core.update_requested = false;
            if passes == MAX_UPDATE_PASSES {
                tracing::warn!(
                    topic = %self.core.topic,
                    topology = self.topology.name(),
                    "Topology keeps requesting updates, deferring"
                );
                // Resume from the loop so other events get a turn first.
                self.core.update_requested = true;
                self.core.scheduler.wake(Wakeup::Update);
                break;
            }
            passes += 1;
            self.topology.update(&mut self.core);
        }
    }

    async fn shutdown(&mut self) {
        // Timers first, so nothing fires against a half-closed swarm.
        self.topology.destroy();

        let mut connections: Vec<Connection> =
            self.core.connections.drain().map(|(_, c)| c).collect();
        futures::future::join_all(connections.iter_mut().map(|c| c.close())).await;
        self.core.publish_connections();
        for connection in &connections {
            let _ = self
                .core
                .event_tx
                .send(SwarmEvent::ConnectionRemoved(connection.remote_id()));
        }
        tracing::info!(
            topic = %self.core.topic,
            closed = connections.len(),
            "Swarm destroyed"
        );
    }

    // ---- Command Handling ----

    fn set_candidates(&mut self, candidates: Vec<PeerId>) {
        let own = self.core.own_peer_id;
        self.core.discovered = candidates.into_iter().filter(|p| *p != own).collect();
        tracing::debug!(
            topic = %self.core.topic,
            candidates = self.core.discovered.len(),
            "Candidates changed"
        );
        self.core.request_update();
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Offer { message, reply } => {
                let _ = reply.send(self.handle_offer(message));
            }
            SwarmCommand::Signal { message, reply } => {
                let _ = reply.send(self.handle_signal(message));
            }
            SwarmCommand::SetTopology { topology, reply } => {
                tracing::info!(
                    topic = %self.core.topic,
                    from = self.topology.name(),
                    to = topology.name(),
                    "Switching topology"
                );
                self.topology.destroy();
                self.topology = topology;
                self.topology.init(&mut self.core);
                self.core.request_update();
                let _ = reply.send(());
            }
            SwarmCommand::GetConnections { reply } => {
                let _ = reply.send(self.core.connection_infos());
            }
            SwarmCommand::GetCandidates { reply } => {
                let _ = reply.send(self.core.candidates());
            }
            // Handled by the loop.
            SwarmCommand::Destroy { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn check_addressed(&self, message: &SignalMessage) -> Result<(), NetworkError> {
        if message.recipient_id != self.core.own_peer_id {
            return Err(NetworkError::ProtocolViolation(format!(
                "message for {} delivered to {}",
                message.recipient_id, self.core.own_peer_id
            )));
        }
        if message.topic != self.core.topic {
            return Err(NetworkError::ProtocolViolation(format!(
                "message for topic {} delivered to swarm {}",
                message.topic, self.core.topic
            )));
        }
        Ok(())
    }

    fn handle_offer(&mut self, message: SignalMessage) -> Result<Answer, NetworkError> {
        self.check_addressed(&message)?;
        let remote = message.sender_id;
        self.core.request_update();

        if let Some(existing) = self.core.connections.get(&remote) {
            if existing.session_id() == message.session_id {
                // Same offer relayed by another rendezvous server.
                tracing::debug!(peer = %remote, "Duplicate offer");
                return Ok(Answer::ACCEPT);
            }
            if existing.initiator() && self.core.own_peer_id < remote {
                // Both sides dialed. The higher id yields, so keep ours.
                tracing::debug!(peer = %remote, "Offer race: keeping own attempt");
                return Ok(Answer::ACCEPT);
            }
            tracing::debug!(
                peer = %remote,
                initiator = existing.initiator(),
                "Replacing existing connection with remote's offer"
            );
            self.core.remove_connection(&remote);
        }

        if !self.topology.on_offer(&remote, &mut self.core) {
            tracing::debug!(peer = %remote, topology = self.topology.name(), "Offer rejected");
            return Ok(Answer::REJECT);
        }
        self.core.create_connection(false, remote, message.session_id)?;
        Ok(Answer::ACCEPT)
    }

    fn handle_signal(&mut self, message: SignalMessage) -> Result<(), NetworkError> {
        self.check_addressed(&message)?;
        match self.core.connections.get_mut(&message.sender_id) {
            Some(connection) => connection.signal(&message),
            None => {
                tracing::debug!(
                    topic = %self.core.topic,
                    peer = %message.sender_id,
                    "Dropping signal for unknown connection"
                );
                Ok(())
            }
        }
    }

    // ---- Event Handling ----

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::OfferAnswered {
                remote_id,
                session_id,
                result,
            } => {
                let current = self
                    .core
                    .connections
                    .get(&remote_id)
                    .map(|c| c.session_id() == session_id)
                    .unwrap_or(false);
                if !current {
                    tracing::debug!(peer = %remote_id, "Ignoring answer for a replaced session");
                    return;
                }
                match result {
                    Ok(answer) if answer.accept => {
                        tracing::debug!(peer = %remote_id, "Offer accepted");
                    }
                    Ok(_) => {
                        tracing::debug!(peer = %remote_id, "Offer rejected, dropping candidate");
                        self.core.evict(&remote_id);
                    }
                    Err(e) => {
                        tracing::warn!(peer = %remote_id, error = %e, "Offer failed, dropping candidate");
                        self.core.evict(&remote_id);
                    }
                }
            }
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let Some(connection) = self.core.connections.get_mut(&event.remote_id) else {
            tracing::trace!(peer = %event.remote_id, "Event for unknown connection");
            return;
        };
        if connection.session_id() != event.session_id {
            tracing::trace!(peer = %event.remote_id, "Event for a replaced session");
            return;
        }

        let connected = matches!(event.event, TransportEvent::Connected(_));
        let before = connection.state();
        connection.handle_event(event.event);
        let after = connection.state();
        if before == after {
            return;
        }

        let peer = event.remote_id;
        self.core.publish_connections();
        let _ = self
            .core
            .event_tx
            .send(SwarmEvent::StateChanged { peer, state: after });
        if connected && after == ConnectionState::Connected {
            let _ = self.core.event_tx.send(SwarmEvent::Connected(peer));
        }

        if after == ConnectionState::Closed {
            self.core.remove_connection(&peer);
            self.core.request_update();
        }
    }

    fn handle_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Update => self.core.request_update(),
            Wakeup::Lookup => self.core.lookup(),
        }
    }
}

impl SwarmCore {
    fn request_update(&mut self) {
        self.update_requested = true;
    }

    fn candidates(&self) -> Vec<PeerId> {
        let mut candidates: Vec<PeerId> = self
            .discovered
            .iter()
            .filter(|p| !self.connections.contains_key(*p))
            .copied()
            .collect();
        candidates.sort();
        candidates
    }

    fn connection_infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> =
            self.connections.values().map(ConnectionInfo::from).collect();
        infos.sort_by_key(|c| c.remote_id);
        infos
    }

    fn publish_connections(&self) {
        self.connections_tx.send_replace(self.connection_infos());
    }

    fn create_connection(
        &mut self,
        initiator: bool,
        remote_id: PeerId,
        session_id: SessionId,
    ) -> Result<(), NetworkError> {
        let options = TransportOptions {
            initiator,
            topic: self.topic,
            own_id: self.own_peer_id,
            remote_id,
            session_id,
        };
        let connection = Connection::open(
            options,
            self.transport.as_ref(),
            self.connection_tx.clone(),
            self.relay.clone(),
            self.protocol.clone(),
        )?;
        let info = ConnectionInfo::from(&connection);
        self.connections.insert(remote_id, connection);
        self.publish_connections();
        let _ = self.event_tx.send(SwarmEvent::ConnectionAdded(info));
        Ok(())
    }

    /// Forget the connection now and tear it down in the background.
    fn remove_connection(&mut self, remote_id: &PeerId) {
        let Some(mut connection) = self.connections.remove(remote_id) else {
            return;
        };
        self.publish_connections();
        let _ = self.event_tx.send(SwarmEvent::ConnectionRemoved(*remote_id));
        tokio::spawn(async move { connection.close().await });
    }

    /// Drop a peer that refused us until the next candidate update.
    fn evict(&mut self, remote_id: &PeerId) {
        self.discovered.remove(remote_id);
        self.remove_connection(remote_id);
        self.request_update();
    }
}

impl SwarmController for SwarmCore {
    fn state(&self) -> SwarmState {
        let mut connected: Vec<PeerId> = self.connections.keys().copied().collect();
        connected.sort();
        SwarmState {
            own_peer_id: self.own_peer_id,
            connected,
            candidates: self.candidates(),
        }
    }

    fn connect(&mut self, peer: PeerId) {
        if peer == self.own_peer_id || self.connections.contains_key(&peer) {
            return;
        }
        let session_id = SessionId::random();
        if let Err(e) = self.create_connection(true, peer, session_id) {
            tracing::warn!(peer = %peer, error = %e, "Failed to create connection");
            self.discovered.remove(&peer);
            return;
        }

        let relay = self.relay.clone();
        let internal_tx = self.internal_tx.clone();
        let message = SignalMessage {
            sender_id: self.own_peer_id,
            recipient_id: peer,
            topic: self.topic,
            session_id,
            payload: SignalPayload::empty(),
        };
        tracing::debug!(topic = %self.topic, peer = %peer, "Sending offer");
        tokio::spawn(async move {
            let result = relay.offer(message).await;
            let _ = internal_tx.send(Internal::OfferAnswered {
                remote_id: peer,
                session_id,
                result,
            });
        });
        self.request_update();
    }

    fn disconnect(&mut self, peer: PeerId) {
        tracing::debug!(topic = %self.topic, peer = %peer, "Disconnecting");
        self.remove_connection(&peer);
        self.request_update();
    }

    fn lookup(&mut self) {
        self.relay.lookup(self.topic);
    }

    fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }
}

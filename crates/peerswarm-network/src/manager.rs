//! Node-level composition root.
//!
//! One `NetworkManager` per node. It owns the signal manager shared by every
//! swarm, the topic registry used to route rendezvous traffic to the right
//! swarm, and one `SwarmMapper` per joined topic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use peerswarm_protocol::{Answer, PeerId, SignalMessage, Topic};
use peerswarm_signal::{RpcConnector, SignalHandler, SignalManager};
use peerswarm_topology::Topology;

use crate::config::NetworkConfig;
use crate::mapper::{GraphSource, SwarmMapper};
use crate::relay::SignalRelay;
use crate::swarm::{Swarm, SwarmHandle, SwarmParams};
use crate::transport::{ProtocolProvider, TransportFactory};
use crate::NetworkError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type SwarmRegistry = Arc<Mutex<HashMap<Topic, SwarmHandle>>>;

/// How to join one topic.
pub struct SwarmOptions {
    pub topic: Topic,
    /// This node's id within the topic.
    pub peer_id: PeerId,
    /// Must be a fresh instance for every swarm.
    pub topology: Box<dyn Topology>,
    /// Application protocol spliced onto every connection.
    pub protocol: Option<Arc<dyn ProtocolProvider>>,
    /// Presence graph used to extend the swarm map, if any.
    pub presence: Option<Arc<dyn GraphSource>>,
}

impl SwarmOptions {
    pub fn new(topic: Topic, peer_id: PeerId, topology: Box<dyn Topology>) -> Self {
        Self {
            topic,
            peer_id,
            topology,
            protocol: None,
            presence: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn ProtocolProvider>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_presence(mut self, presence: Arc<dyn GraphSource>) -> Self {
        self.presence = Some(presence);
        self
    }
}

/// Routes inbound rendezvous traffic to the swarm of its topic.
struct SwarmRouter {
    swarms: SwarmRegistry,
}

impl SwarmRouter {
    fn swarm(&self, topic: &Topic) -> Option<SwarmHandle> {
        lock(&self.swarms).get(topic).cloned()
    }
}

#[async_trait]
impl SignalHandler for SwarmRouter {
    async fn on_offer(&self, message: SignalMessage) -> Answer {
        let Some(swarm) = self.swarm(&message.topic) else {
            tracing::debug!(topic = %message.topic, peer = %message.sender_id, "Offer for unknown topic");
            return Answer::REJECT;
        };
        match swarm.on_offer(message).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(topic = %swarm.topic(), error = %e, "Offer handling failed");
                Answer::REJECT
            }
        }
    }

    async fn on_signal(&self, message: SignalMessage) {
        let Some(swarm) = self.swarm(&message.topic) else {
            tracing::debug!(topic = %message.topic, peer = %message.sender_id, "Signal for unknown topic");
            return;
        };
        if let Err(e) = swarm.on_signal(message).await {
            tracing::warn!(topic = %swarm.topic(), error = %e, "Signal handling failed");
        }
    }

    fn on_candidates_changed(&self, topic: Topic, candidates: Vec<PeerId>) {
        let Some(swarm) = self.swarm(&topic) else {
            tracing::trace!(topic = %topic, "Candidates for unknown topic");
            return;
        };
        if let Err(e) = swarm.post_candidates(candidates) {
            tracing::debug!(topic = %topic, error = %e, "Swarm gone, dropping candidates");
        }
    }
}

/// Manages every swarm of this node.
pub struct NetworkManager {
    config: NetworkConfig,
    signal: SignalManager,
    transport: Arc<dyn TransportFactory>,
    swarms: SwarmRegistry,
    maps: Mutex<HashMap<Topic, Arc<SwarmMapper>>>,
}

impl NetworkManager {
    pub fn new(
        config: NetworkConfig,
        connector: Arc<dyn RpcConnector>,
        transport: Arc<dyn TransportFactory>,
    ) -> Self {
        let swarms: SwarmRegistry = Arc::new(Mutex::new(HashMap::new()));
        let router = Arc::new(SwarmRouter {
            swarms: swarms.clone(),
        });
        let signal = SignalManager::with_options(
            config.signal.servers.clone(),
            connector,
            router,
            config.signal_options(),
        );
        tracing::info!(servers = config.signal.servers.len(), "Network manager created");

        Self {
            config,
            signal,
            transport,
            swarms,
            maps: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to every signal server.
    pub async fn start(&self) {
        self.signal.start().await;
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn signal(&self) -> &SignalManager {
        &self.signal
    }

    /// Fresh instance of the configured topology.
    pub fn default_topology(&self) -> Result<Box<dyn Topology>, anyhow::Error> {
        self.config.topology.build()
    }

    /// Start swarming on a topic.
    pub fn join_swarm(&self, options: SwarmOptions) -> Result<SwarmHandle, NetworkError> {
        let topic = options.topic;
        let mut swarms = lock(&self.swarms);
        if swarms.contains_key(&topic) {
            return Err(NetworkError::AlreadyJoined(topic));
        }

        let relay: Arc<dyn SignalRelay> = Arc::new(self.signal.clone());
        let handle = Swarm::spawn(SwarmParams {
            topic,
            own_peer_id: options.peer_id,
            topology: options.topology,
            relay,
            transport: self.transport.clone(),
            protocol: options.protocol,
        });
        swarms.insert(topic, handle.clone());
        drop(swarms);

        let mapper = SwarmMapper::new(&handle, options.presence);
        lock(&self.maps).insert(topic, Arc::new(mapper));
        self.signal.join(topic, options.peer_id);

        tracing::info!(topic = %topic, peer = %options.peer_id, "Joined swarm");
        Ok(handle)
    }

    /// Stop swarming on a topic and close its connections.
    pub async fn leave_swarm(&self, topic: &Topic) -> Result<(), NetworkError> {
        let Some(swarm) = self.swarm(topic) else {
            return Err(NetworkError::NotJoined(*topic));
        };

        self.signal.leave(*topic);
        if let Some(mapper) = lock(&self.maps).remove(topic) {
            mapper.destroy();
        }
        let result = swarm.destroy().await;
        lock(&self.swarms).remove(topic);

        tracing::info!(topic = %topic, "Left swarm");
        result
    }

    pub fn swarm(&self, topic: &Topic) -> Option<SwarmHandle> {
        lock(&self.swarms).get(topic).cloned()
    }

    pub fn swarm_map(&self, topic: &Topic) -> Option<Arc<SwarmMapper>> {
        lock(&self.maps).get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = lock(&self.swarms).keys().copied().collect();
        topics.sort();
        topics
    }

    /// Leave every swarm and disconnect from the signal servers.
    pub async fn destroy(&self) {
        for topic in self.topics() {
            if let Err(e) = self.leave_swarm(&topic).await {
                tracing::warn!(topic = %topic, error = %e, "Failed to leave swarm");
            }
        }
        self.signal.close().await;
        tracing::info!("Network manager destroyed");
    }
}

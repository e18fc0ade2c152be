//! In-process transport.
//!
//! Sessions of one registry find each other by (topic, peer, remote, session).
//! The responder answers as soon as it is created; when the initiator sees
//! the answer both sides are handed the ends of one in-memory duplex pipe.
//! Destroying a session closes its counterpart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use peerswarm_protocol::{PeerId, SessionId, SignalPayload, Topic};

use crate::transport::{
    TransportEvents, TransportFactory, TransportOptions, TransportSession,
};
use crate::NetworkError;

const PIPE_BUFFER_BYTES: usize = 64 * 1024;
const ANSWER: &str = "answer";

type SessionKey = (Topic, PeerId, PeerId, SessionId);

/// Shared pairing table. Every transport that should reach the others must
/// use the same registry.
#[derive(Clone, Default)]
pub struct MemoryTransportRegistry {
    sessions: Arc<Mutex<HashMap<SessionKey, TransportEvents>>>,
}

impl MemoryTransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, TransportEvents>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport factory backed by a `MemoryTransportRegistry`.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    registry: MemoryTransportRegistry,
}

impl MemoryTransport {
    pub fn new(registry: MemoryTransportRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MemoryTransportRegistry {
        &self.registry
    }
}

impl TransportFactory for MemoryTransport {
    fn create(
        &self,
        options: TransportOptions,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportSession>, NetworkError> {
        let key = (options.topic, options.own_id, options.remote_id, options.session_id);
        {
            let mut sessions = self.registry.lock();
            if sessions.contains_key(&key) {
                return Err(NetworkError::Transport(format!(
                    "session {} already registered",
                    options.session_id
                )));
            }
            sessions.insert(key, events.clone());
        }
        if !options.initiator {
            events.signal(SignalPayload::of_kind(ANSWER));
        }
        Ok(Box::new(MemorySession {
            registry: self.registry.clone(),
            key,
            events,
            initiator: options.initiator,
            connected: false,
            destroyed: false,
        }))
    }
}

struct MemorySession {
    registry: MemoryTransportRegistry,
    key: SessionKey,
    events: TransportEvents,
    initiator: bool,
    connected: bool,
    destroyed: bool,
}

impl MemorySession {
    fn counterpart_key(&self) -> SessionKey {
        let (topic, own, remote, session) = self.key;
        (topic, remote, own, session)
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), NetworkError> {
        if self.destroyed {
            return Ok(());
        }
        if !self.initiator || payload.kind() != Some(ANSWER) {
            tracing::trace!(kind = ?payload.kind(), "Memory transport ignoring payload");
            return Ok(());
        }
        if self.connected {
            return Ok(());
        }
        let counterpart = self
            .registry
            .lock()
            .get(&self.counterpart_key())
            .cloned()
            .ok_or_else(|| NetworkError::Transport("responder session not found".into()))?;

        let (ours, theirs) = tokio::io::duplex(PIPE_BUFFER_BYTES);
        self.connected = true;
        self.events.connected(Box::new(ours));
        counterpart.connected(Box::new(theirs));
        Ok(())
    }

    async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let counterpart = {
            let mut sessions = self.registry.lock();
            sessions.remove(&self.key);
            sessions.get(&self.counterpart_key()).cloned()
        };
        if let Some(counterpart) = counterpart {
            counterpart.closed();
        }
    }
}

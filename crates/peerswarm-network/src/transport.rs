//! Seams to the negotiation transport and the application protocol.
//!
//! A transport session negotiates one point-to-point link. It consumes the
//! remote's negotiation payloads through `signal()` and reports progress as
//! `TransportEvent`s, which the owning swarm receives tagged with the remote
//! peer and session. Once connected it hands over a byte stream, which the
//! connection splices to the stream opened by the application protocol.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use peerswarm_protocol::{PeerId, SessionId, SignalPayload, Topic, KEY_LENGTH};

use crate::NetworkError;

/// Bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type ByteStream = Box<dyn AsyncStream>;

/// Parameters of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub initiator: bool,
    pub topic: Topic,
    pub own_id: PeerId,
    pub remote_id: PeerId,
    pub session_id: SessionId,
}

/// Progress reported by a transport session.
pub enum TransportEvent {
    /// Negotiation data to relay to the remote.
    Signal(SignalPayload),
    /// The link is up.
    Connected(ByteStream),
    /// The link is gone.
    Closed,
    Error(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Signal(payload) => f.debug_tuple("Signal").field(payload).finish(),
            TransportEvent::Connected(_) => f.write_str("Connected(..)"),
            TransportEvent::Closed => f.write_str("Closed"),
            TransportEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// A `TransportEvent` tagged with the session it belongs to.
#[derive(Debug)]
pub struct ConnectionEvent {
    pub remote_id: PeerId,
    pub session_id: SessionId,
    pub event: TransportEvent,
}

/// Where a session reports its events.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    remote_id: PeerId,
    session_id: SessionId,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl TransportEvents {
    pub fn new(
        remote_id: PeerId,
        session_id: SessionId,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            remote_id,
            session_id,
            tx,
        }
    }

    /// Report `event`. Returns false once the owning swarm is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(ConnectionEvent {
                remote_id: self.remote_id,
                session_id: self.session_id,
                event,
            })
            .is_ok()
    }

    pub fn signal(&self, payload: SignalPayload) -> bool {
        self.emit(TransportEvent::Signal(payload))
    }

    pub fn connected(&self, stream: ByteStream) -> bool {
        self.emit(TransportEvent::Connected(stream))
    }

    pub fn closed(&self) -> bool {
        self.emit(TransportEvent::Closed)
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(reason.into()))
    }
}

/// One negotiation session.
#[async_trait]
pub trait TransportSession: Send {
    /// Feed negotiation data received from the remote.
    fn signal(&mut self, payload: SignalPayload) -> Result<(), NetworkError>;

    /// Tear the session down and wait until it is gone. Idempotent.
    async fn destroy(&mut self);
}

/// Creates transport sessions.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        options: TransportOptions,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportSession>, NetworkError>;
}

/// What the application protocol is told about a new link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolContext {
    pub topic: Topic,
    /// Channel name for the protocol, derived from the topic.
    pub discovery_key: [u8; KEY_LENGTH],
    pub own_id: PeerId,
    pub remote_id: PeerId,
    pub session_id: SessionId,
    pub initiator: bool,
}

/// Application protocol carried over connections.
pub trait ProtocolProvider: Send + Sync {
    /// Open the application side of a new link. Bytes written to the returned
    /// stream go to the remote; bytes from the remote are readable from it.
    fn open(&self, context: ProtocolContext) -> ByteStream;
}

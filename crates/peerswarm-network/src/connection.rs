//! One negotiated session with a remote peer.
//!
//! A connection wraps a transport session and moves through
//! `Initiating`/`Waiting` -> `Connected` -> `Closed`. Negotiation payloads
//! the transport produces are queued and relayed in order by a dedicated
//! task. Once the transport is up, its stream is spliced to the application
//! protocol's stream until the connection closes.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peerswarm_protocol::{PeerId, SessionId, SignalMessage, SignalPayload, Topic};

use crate::relay::SignalRelay;
use crate::transport::{
    ByteStream, ConnectionEvent, ProtocolContext, ProtocolProvider, TransportEvent,
    TransportEvents, TransportFactory, TransportOptions, TransportSession,
};
use crate::NetworkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// We sent the offer and wait for the transport to come up.
    Initiating,
    /// We accepted an offer and wait for the transport to come up.
    Waiting,
    Connected,
    Closed,
}

pub struct Connection {
    options: TransportOptions,
    state: ConnectionState,
    session: Option<Box<dyn TransportSession>>,
    outbound: Option<mpsc::UnboundedSender<SignalPayload>>,
    outbound_task: Option<JoinHandle<()>>,
    protocol: Option<Arc<dyn ProtocolProvider>>,
    splice: Option<JoinHandle<()>>,
    /// Transport stream kept open when no protocol is attached.
    idle_stream: Option<ByteStream>,
}

impl Connection {
    /// Create the transport session and start the outbound signal queue.
    pub fn open(
        options: TransportOptions,
        factory: &dyn TransportFactory,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        relay: Arc<dyn SignalRelay>,
        protocol: Option<Arc<dyn ProtocolProvider>>,
    ) -> Result<Self, NetworkError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let outbound_task = tokio::spawn(relay_signals(options.clone(), relay, outbound_rx));

        let transport_events = TransportEvents::new(options.remote_id, options.session_id, events);
        let session = match factory.create(options.clone(), transport_events) {
            Ok(session) => session,
            Err(e) => {
                outbound_task.abort();
                return Err(e);
            }
        };

        let state = if options.initiator {
            ConnectionState::Initiating
        } else {
            ConnectionState::Waiting
        };
        tracing::debug!(
            topic = %options.topic,
            peer = %options.remote_id,
            session = %options.session_id.short(),
            initiator = options.initiator,
            "Connection created"
        );

        Ok(Self {
            options,
            state,
            session: Some(session),
            outbound: Some(outbound_tx),
            outbound_task: Some(outbound_task),
            protocol,
            splice: None,
            idle_stream: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_id(&self) -> PeerId {
        self.options.remote_id
    }

    pub fn session_id(&self) -> SessionId {
        self.options.session_id
    }

    pub fn initiator(&self) -> bool {
        self.options.initiator
    }

    pub fn topic(&self) -> Topic {
        self.options.topic
    }

    /// Hand a negotiation message from the remote to the transport.
    pub fn signal(&mut self, message: &SignalMessage) -> Result<(), NetworkError> {
        if message.session_id != self.options.session_id {
            tracing::debug!(
                peer = %self.options.remote_id,
                expected = %self.options.session_id.short(),
                got = %message.session_id.short(),
                "Dropping signal for another session"
            );
            return Ok(());
        }
        if message.sender_id != self.options.remote_id
            || message.recipient_id != self.options.own_id
        {
            return Err(NetworkError::ProtocolViolation(format!(
                "signal from {} to {} on connection {} -> {}",
                message.sender_id,
                message.recipient_id,
                self.options.own_id,
                self.options.remote_id
            )));
        }
        if message.payload.is_offer() && self.state == ConnectionState::Initiating {
            return Err(NetworkError::InvalidState(
                "initiating connection received an offer".into(),
            ));
        }
        match self.session.as_mut() {
            Some(session) if self.state != ConnectionState::Closed => {
                session.signal(message.payload.clone())
            }
            _ => {
                tracing::debug!(peer = %self.options.remote_id, "Dropping signal for closed connection");
                Ok(())
            }
        }
    }

    /// Apply an event reported by the transport session.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Signal(payload) => {
                if let Some(outbound) = &self.outbound {
                    let _ = outbound.send(payload);
                }
            }
            TransportEvent::Connected(stream) => {
                if self.state == ConnectionState::Closed {
                    return;
                }
                tracing::info!(
                    topic = %self.options.topic,
                    peer = %self.options.remote_id,
                    "Connection established"
                );
                self.state = ConnectionState::Connected;
                self.attach(stream);
            }
            TransportEvent::Closed => {
                tracing::debug!(peer = %self.options.remote_id, "Transport closed");
                self.state = ConnectionState::Closed;
                self.detach();
            }
            TransportEvent::Error(reason) => {
                tracing::warn!(
                    topic = %self.options.topic,
                    peer = %self.options.remote_id,
                    error = %reason,
                    "Transport error"
                );
            }
        }
    }

    /// Close the connection and wait for the transport session to go away.
    /// Closing twice is a no-op.
    pub async fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.detach();
        self.outbound = None;
        if let Some(task) = self.outbound_task.take() {
            task.abort();
        }
        if let Some(mut session) = self.session.take() {
            session.destroy().await;
            tracing::debug!(
                topic = %self.options.topic,
                peer = %self.options.remote_id,
                "Connection closed"
            );
        }
    }

    fn attach(&mut self, mut transport_stream: ByteStream) {
        let Some(protocol) = &self.protocol else {
            self.idle_stream = Some(transport_stream);
            return;
        };
        let mut app_stream = protocol.open(ProtocolContext {
            topic: self.options.topic,
            discovery_key: self.options.topic.discovery_key(),
            own_id: self.options.own_id,
            remote_id: self.options.remote_id,
            session_id: self.options.session_id,
            initiator: self.options.initiator,
        });
        let peer = self.options.remote_id;
        self.splice = Some(tokio::spawn(async move {
            match tokio::io::copy_bidirectional(&mut app_stream, &mut transport_stream).await {
                Ok((sent, received)) => {
                    tracing::debug!(peer = %peer, sent, received, "Protocol stream finished")
                }
                Err(e) => tracing::debug!(peer = %peer, error = %e, "Protocol stream failed"),
            }
        }));
    }

    fn detach(&mut self) {
        if let Some(splice) = self.splice.take() {
            splice.abort();
        }
        self.idle_stream = None;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(splice) = self.splice.take() {
            splice.abort();
        }
        if let Some(task) = self.outbound_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_id", &self.options.remote_id)
            .field("session_id", &self.options.session_id)
            .field("initiator", &self.options.initiator)
            .field("state", &self.state)
            .finish()
    }
}

/// Relay payloads in production order until the queue is closed.
async fn relay_signals(
    options: TransportOptions,
    relay: Arc<dyn SignalRelay>,
    mut payloads: mpsc::UnboundedReceiver<SignalPayload>,
) {
    while let Some(payload) = payloads.recv().await {
        let message = SignalMessage {
            sender_id: options.own_id,
            recipient_id: options.remote_id,
            topic: options.topic,
            session_id: options.session_id,
            payload,
        };
        if let Err(e) = relay.signal(message).await {
            tracing::warn!(peer = %options.remote_id, error = %e, "Failed to relay signal");
        }
    }
}

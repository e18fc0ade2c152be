use async_trait::async_trait;

use peerswarm_protocol::{Answer, SignalMessage, Topic};
use peerswarm_signal::SignalManager;

use crate::NetworkError;

/// Outbound signaling as seen by a swarm and its connections.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Ask the recipient to accept a connection.
    async fn offer(&self, message: SignalMessage) -> Result<Answer, NetworkError>;

    /// Relay negotiation data.
    async fn signal(&self, message: SignalMessage) -> Result<(), NetworkError>;

    /// Refresh the candidate list of `topic` in the background.
    fn lookup(&self, topic: Topic);
}

#[async_trait]
impl SignalRelay for SignalManager {
    async fn offer(&self, message: SignalMessage) -> Result<Answer, NetworkError> {
        Ok(SignalManager::offer(self, message).await?)
    }

    async fn signal(&self, message: SignalMessage) -> Result<(), NetworkError> {
        SignalManager::signal(self, message).await;
        Ok(())
    }

    fn lookup(&self, topic: Topic) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.lookup(topic).await {
                tracing::warn!(topic = %topic, error = %e, "Candidate lookup failed");
            }
        });
    }
}

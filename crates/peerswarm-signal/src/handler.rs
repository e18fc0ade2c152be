use async_trait::async_trait;

use peerswarm_protocol::{Answer, PeerId, SignalMessage, Topic};

/// Receiver of everything the rendezvous servers push to this node.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    /// A remote peer asks to open a connection. The answer is relayed back.
    async fn on_offer(&self, message: SignalMessage) -> Answer;

    /// Negotiation data for an existing connection attempt.
    async fn on_signal(&self, message: SignalMessage);

    /// The deduplicated candidate set for `topic` changed.
    fn on_candidates_changed(&self, topic: Topic, candidates: Vec<PeerId>);
}

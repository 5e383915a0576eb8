//! Signaling transport between call coordinators.
//!
//! [`SignalingChannel`] is the point-to-point send contract the coordinator
//! depends on. [`SignalingHub`] is the in-process implementation: every
//! participant registers once and receives the envelopes addressed to it.

use std::collections::HashMap;

use async_trait::async_trait;
use porteiro_core::signaling::SignalEnvelope;
use porteiro_core::types::EntityId;
use tokio::sync::{mpsc, RwLock};

/// Channel sender half for pushing envelopes to one participant.
pub type SignalSender = mpsc::UnboundedSender<SignalEnvelope>;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// No participant with this id is registered.
    #[error("Unknown signaling peer: {0}")]
    UnknownPeer(EntityId),

    /// The participant's receiver has gone away.
    #[error("Signaling channel to {0} is closed")]
    ChannelClosed(EntityId),
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver `envelope` to `envelope.to`.
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
}

/// Routes envelopes between participants registered in this process.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared by every coordinator.
pub struct SignalingHub {
    peers: RwLock<HashMap<EntityId, SignalSender>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a participant.
    ///
    /// Returns the receiver half of its inbox. Registering an id again
    /// replaces the previous inbox.
    pub async fn register(
        &self,
        participant_id: impl Into<EntityId>,
    ) -> mpsc::UnboundedReceiver<SignalEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(participant_id.into(), tx);
        rx
    }

    pub async fn unregister(&self, participant_id: &str) {
        self.peers.write().await.remove(participant_id);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

impl Default for SignalingHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingChannel for SignalingHub {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        let to = envelope.to.clone();
        let result = {
            let peers = self.peers.read().await;
            let sender = peers
                .get(&to)
                .ok_or_else(|| SignalingError::UnknownPeer(to.clone()))?;
            sender.send(envelope)
        };

        if result.is_err() {
            // Receiver dropped without unregistering.
            self.peers.write().await.remove(&to);
            return Err(SignalingError::ChannelClosed(to));
        }
        Ok(())
    }
}

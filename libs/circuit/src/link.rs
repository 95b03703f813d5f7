use std::sync::Arc;

use circuit_core::{Envelope, Result, Subscription, Transport};

/// A circuit's identity plus its transport, handed to the directory and
/// router when they bind
#[derive(Clone)]
pub(crate) struct Link {
    circuit_id: String,
    transport: Arc<dyn Transport>,
}

impl Link {
    pub(crate) fn new(circuit_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            circuit_id: circuit_id.into(),
            transport,
        }
    }

    pub(crate) fn circuit_id(&self) -> &str {
        &self.circuit_id
    }

    /// Stamp channel and sender, then publish on `channel`
    pub(crate) async fn publish(&self, channel: &str, mut envelope: Envelope) -> Result<()> {
        envelope.channel = channel.to_string();
        envelope.sender = self.circuit_id.clone();
        self.transport.publish(channel, envelope).await
    }

    /// Publish to a delivery address that differs from the envelope's channel
    pub(crate) async fn send(&self, address: &str, mut envelope: Envelope) -> Result<()> {
        envelope.sender = self.circuit_id.clone();
        self.transport.publish(address, envelope).await
    }

    pub(crate) async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<()> {
        self.transport.subscribe(channel, subscription).await
    }
}

use crate::envelope::Envelope;
use crate::error::Result;
use crate::subscription::Subscription;

/// Pub/sub capability consumed by circuits
///
/// A transport may be shared by several circuits, so every method takes
/// `&self` and implementations keep their own interior state.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Fails with `AlreadyConnected` when connected
    async fn connect(&self) -> Result<()>;

    /// Fails with `NotConnected` when not connected
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Deliver an envelope to the current subscribers of `channel`
    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<()>;

    /// Register interest in `channel`
    async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<()>;
}

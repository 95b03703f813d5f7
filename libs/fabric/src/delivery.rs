use tokio::sync::mpsc;
use tracing::trace;

use circuit_core::{Envelope, Subscription};

/// Per-subscription FIFO feeding a delivery task
///
/// The task awaits the handler for one envelope before taking the next,
/// so a subscription sees its channel in publish order while publishers
/// never wait on handlers.
pub(crate) struct Mailbox {
    subscription_id: String,
    sender: mpsc::UnboundedSender<Envelope>,
}

impl Mailbox {
    pub(crate) fn spawn(subscription: Subscription) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        let subscription_id = subscription.id().to_string();

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                subscription.deliver(envelope).await;
            }
            trace!(subscription = subscription.id(), "Delivery task finished");
        });

        Self {
            subscription_id,
            sender,
        }
    }

    /// Queue an envelope; false once the delivery task is gone
    pub(crate) fn post(&self, envelope: Envelope) -> bool {
        self.sender.send(envelope).is_ok()
    }

    pub(crate) fn subscription_id(&self) -> &str {
        &self.subscription_id
    }
}

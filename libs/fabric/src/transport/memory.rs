use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use circuit_core::{Envelope, Error, Result, Subscription, Transport};

use crate::delivery::Mailbox;

#[derive(Default)]
struct State {
    connected: bool,
    /// Envelopes published while a channel had no subscribers
    queues: HashMap<String, Vec<Envelope>>,
    subscribers: HashMap<String, Vec<Mailbox>>,
}

impl State {
    fn clear(&mut self) {
        self.queues.clear();
        self.subscribers.clear();
    }
}

/// In-process transport, the reference medium for tests and single-node setups
///
/// Behaves like a queueing broker rather than a plain fan-out: envelopes
/// published to a channel nobody listens on are kept and handed to the
/// first subscription registered on that channel.
///
/// Share one instance between circuits (`Arc<MemoryTransport>`) to
/// simulate several nodes on one medium.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

impl MemoryTransport {
    /// Disconnected transport with no queued traffic
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of envelopes waiting for a subscriber on `channel`
    pub fn queued(&self, channel: &str) -> usize {
        self.state().queues.get(channel).map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state();
        if state.connected {
            return Err(Error::AlreadyConnected);
        }

        state.clear();
        state.connected = true;
        debug!("Memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(Error::NotConnected);
        }

        state.connected = false;
        state.clear();
        debug!("Memory transport disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn publish(&self, channel: &str, envelope: Envelope) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(Error::NotConnected);
        }

        match state.subscribers.get(channel) {
            Some(mailboxes) if !mailboxes.is_empty() => {
                for mailbox in mailboxes {
                    if !mailbox.post(envelope.clone()) {
                        warn!(
                            channel,
                            subscription = mailbox.subscription_id(),
                            "Delivery task gone, envelope dropped"
                        );
                    }
                }
                trace!(channel, receivers = mailboxes.len(), "Envelope published");
            }
            _ => {
                state
                    .queues
                    .entry(channel.to_string())
                    .or_default()
                    .push(envelope);
                trace!(channel, "Envelope queued, no subscribers");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str, subscription: Subscription) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(Error::NotConnected);
        }

        let mailbox = Mailbox::spawn(subscription);

        if let Some(queued) = state.queues.remove(channel) {
            trace!(channel, count = queued.len(), "Delivering queued envelopes");
            for envelope in queued {
                mailbox.post(envelope);
            }
        }

        state
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(mailbox);

        Ok(())
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use circuit_core::channel::{is_control_channel, network_channel_for, NETWORK_CHANNEL};
use circuit_core::{subscribe_handler, Envelope, Error, Result, Subscription};

use crate::link::Link;

/// Control-plane verb carried on the `$network` channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Join,
    Add,
    Remove,
}

/// Control-plane payload: `{ "action": ..., "channels": [...] }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkChange {
    pub action: Action,
    pub channels: Vec<String>,
}

#[derive(Default)]
struct Table {
    /// Ordered so every circuit cycles owners in the same order
    owners: HashMap<String, BTreeSet<String>>,
    cursors: HashMap<String, usize>,
}

impl Table {
    fn add(&mut self, channel: &str, circuit_id: &str) -> bool {
        self.owners
            .entry(channel.to_string())
            .or_default()
            .insert(circuit_id.to_string())
    }

    fn remove(&mut self, channel: &str, circuit_id: &str) -> bool {
        let Some(members) = self.owners.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(circuit_id);
        if members.is_empty() {
            self.owners.remove(channel);
            self.cursors.remove(channel);
        }
        removed
    }

    fn channels_of(&self, circuit_id: &str) -> Vec<String> {
        let mut channels: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, members)| members.contains(circuit_id))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }
}

/// A circuit's local, eventually-consistent view of channel ownership
///
/// Local registrations are gossiped on `$network`; remote ones arrive
/// through the same channel or, right after joining, on the circuit's
/// directed `$network.<id>` channel.
#[derive(Clone)]
pub struct Directory {
    link: Link,
    table: Arc<Mutex<Table>>,
}

impl Directory {
    /// Subscribe to both control channels and announce the join
    pub(crate) async fn bind(link: Link) -> Result<Self> {
        let directory = Self {
            link,
            table: Arc::default(),
        };

        for channel in [
            NETWORK_CHANNEL.to_string(),
            network_channel_for(directory.link.circuit_id()),
        ] {
            let handle = directory.clone();
            let subscription = Subscription::new(subscribe_handler(move |envelope| {
                let handle = handle.clone();
                async move { handle.handle_change(envelope).await }
            }));
            directory.link.subscribe(&channel, subscription).await?;
        }

        directory.broadcast(Action::Join, Vec::new()).await?;
        Ok(directory)
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn broadcast(&self, action: Action, channels: Vec<String>) -> Result<()> {
        let envelope = Envelope::with_content(&NetworkChange { action, channels })?;
        self.link.publish(NETWORK_CHANNEL, envelope).await
    }

    pub(crate) async fn handle_change(&self, envelope: Envelope) {
        if envelope.sender == self.link.circuit_id() {
            return;
        }

        let change: NetworkChange = match envelope.content_as() {
            Ok(change) => change,
            Err(e) => {
                warn!(
                    sender = %envelope.sender,
                    error = %e,
                    "Malformed network change dropped"
                );
                return;
            }
        };

        match change.action {
            Action::Add => {
                let mut table = self.table();
                for channel in change.channels.iter().filter(|c| !is_control_channel(c)) {
                    if table.add(channel, &envelope.sender) {
                        debug!(
                            channel = %channel,
                            owner = %envelope.sender,
                            "Remote owner added"
                        );
                    }
                }
            }
            Action::Remove => {
                let mut table = self.table();
                for channel in &change.channels {
                    if table.remove(channel, &envelope.sender) {
                        debug!(
                            channel = %channel,
                            owner = %envelope.sender,
                            "Remote owner removed"
                        );
                    }
                }
            }
            Action::Join => {
                if let Err(e) = self.send_own_channels(&envelope.sender).await {
                    warn!(joiner = %envelope.sender, error = %e, "Join reply failed");
                }
            }
        }
    }

    /// Whisper this circuit's channels to a freshly joined circuit
    async fn send_own_channels(&self, joiner: &str) -> Result<()> {
        let channels = self.table().channels_of(self.link.circuit_id());
        if channels.is_empty() {
            return Ok(());
        }

        trace!(joiner, ?channels, "Answering join");
        let mut envelope = Envelope::with_content(&NetworkChange {
            action: Action::Add,
            channels,
        })?;
        envelope.recipient = Some(joiner.to_string());
        self.link.publish(&network_channel_for(joiner), envelope).await
    }

    /// Claim ownership of `channels` and gossip an `add`
    ///
    /// Control channels are skipped; nothing is sent when no channel
    /// remains.
    pub async fn register<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels = user_channels(channels);
        if channels.is_empty() {
            return Ok(());
        }

        {
            let mut table = self.table();
            for channel in &channels {
                table.add(channel, self.link.circuit_id());
            }
        }

        self.broadcast(Action::Add, channels).await
    }

    /// Give up ownership of `channels` and gossip a `remove`
    pub async fn deregister<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels = user_channels(channels);
        if channels.is_empty() {
            return Ok(());
        }

        {
            let mut table = self.table();
            for channel in &channels {
                table.remove(channel, self.link.circuit_id());
            }
        }

        self.broadcast(Action::Remove, channels).await
    }

    /// Pick an owner of `channel`, round robin across known owners
    pub fn find(&self, channel: &str) -> Result<String> {
        let mut table = self.table();
        let Table { owners, cursors } = &mut *table;

        let members = owners
            .get(channel)
            .filter(|members| !members.is_empty())
            .ok_or_else(|| Error::not_found(channel))?;

        if members.len() == 1 {
            return members
                .iter()
                .next()
                .cloned()
                .ok_or_else(|| Error::not_found(channel));
        }

        let cursor = cursors.entry(channel.to_string()).or_insert(0);
        let index = *cursor % members.len();
        *cursor = cursor.wrapping_add(1);

        members
            .iter()
            .nth(index)
            .cloned()
            .ok_or_else(|| Error::not_found(channel))
    }

    /// Every circuit currently known to own `channel`
    pub fn owners(&self, channel: &str) -> Vec<String> {
        self.table()
            .owners
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels this circuit has registered
    pub fn local_channels(&self) -> Vec<String> {
        self.table().channels_of(self.link.circuit_id())
    }
}

fn user_channels<I, S>(channels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    channels
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .filter(|c| !is_control_channel(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_core::Transport;
    use circuit_fabric::MemoryTransport;
    use serde_json::json;

    async fn bound(id: &str) -> (Directory, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect().await.unwrap();
        let directory = Directory::bind(Link::new(id, transport.clone())).await.unwrap();
        (directory, transport)
    }

    fn change(sender: &str, action: Action, channels: &[&str]) -> Envelope {
        let mut envelope = Envelope::with_content(&NetworkChange {
            action,
            channels: channels.iter().map(|c| c.to_string()).collect(),
        })
        .unwrap();
        envelope.sender = sender.to_string();
        envelope
    }

    #[test]
    fn wire_format() {
        let payload = NetworkChange {
            action: Action::Add,
            channels: vec!["a".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"action": "add", "channels": ["a"]})
        );

        let join: NetworkChange =
            serde_json::from_value(json!({"action": "join", "channels": []})).unwrap();
        assert_eq!(join.action, Action::Join);
    }

    #[tokio::test]
    async fn finds_local_channels() {
        let (d, _t) = bound("c1").await;
        d.register(["a", "b"]).await.unwrap();

        assert_eq!(d.find("a").unwrap(), "c1");
        assert_eq!(d.find("b").unwrap(), "c1");
        assert!(matches!(d.find("c"), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn control_channels_never_register() {
        let (d, _t) = bound("c1").await;
        d.register(["$network", "$network.c1"]).await.unwrap();

        assert!(d.local_channels().is_empty());
        assert!(d.find("$network").is_err());
    }

    #[tokio::test]
    async fn add_and_remove_changes() {
        let (d, _t) = bound("b1").await;
        d.register(["c"]).await.unwrap();

        d.handle_change(change("b2", Action::Add, &["a", "b"])).await;
        assert_eq!(d.find("a").unwrap(), "b2");
        assert_eq!(d.find("b").unwrap(), "b2");
        assert_eq!(d.find("c").unwrap(), "b1");

        d.handle_change(change("b2", Action::Remove, &["a"])).await;
        assert!(matches!(d.find("a"), Err(Error::NotFound { .. })));
        assert_eq!(d.find("b").unwrap(), "b2");
        assert_eq!(d.find("c").unwrap(), "b1");
    }

    #[tokio::test]
    async fn ignores_own_messages() {
        let (d, _t) = bound("b1").await;
        d.register(["x"]).await.unwrap();

        d.handle_change(change("b1", Action::Add, &["y"])).await;
        d.handle_change(change("b1", Action::Remove, &["x"])).await;
        d.handle_change(change("b1", Action::Join, &[])).await;

        assert_eq!(d.local_channels(), vec!["x".to_string()]);
        assert!(d.find("y").is_err());
    }

    #[tokio::test]
    async fn malformed_changes_are_dropped() {
        let (d, _t) = bound("b1").await;
        let mut envelope = Envelope::with_content(&"garbage").unwrap();
        envelope.sender = "b2".to_string();

        d.handle_change(envelope).await;
        assert!(d.owners("garbage").is_empty());
    }

    #[tokio::test]
    async fn round_robin_cycles_every_owner() {
        let (d, _t) = bound("m1").await;
        d.register(["a"]).await.unwrap();
        d.handle_change(change("m2", Action::Add, &["a"])).await;
        d.handle_change(change("m3", Action::Add, &["a"])).await;

        let picks: Vec<String> = (0..6).map(|_| d.find("a").unwrap()).collect();
        assert_eq!(picks, vec!["m1", "m2", "m3", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn single_owner_skips_the_cursor() {
        let (d, _t) = bound("m1").await;
        d.handle_change(change("m2", Action::Add, &["a"])).await;

        for _ in 0..3 {
            assert_eq!(d.find("a").unwrap(), "m2");
        }
        assert!(d.table().cursors.get("a").is_none());
    }

    #[tokio::test]
    async fn deregister_forgets_local_ownership() {
        let (d, _t) = bound("c1").await;
        d.register(["a"]).await.unwrap();
        d.deregister(["a"]).await.unwrap();

        assert!(d.find("a").is_err());
        assert!(d.local_channels().is_empty());
    }

    #[tokio::test]
    async fn join_is_answered_on_the_directed_channel() {
        let (d, t) = bound("b1").await;
        d.register(["a", "b"]).await.unwrap();

        // Nobody listens on b2's directed channel, so the reply stays queued
        d.handle_change(change("b2", Action::Join, &[])).await;
        assert_eq!(t.queued("$network.b2"), 1);
    }

    #[tokio::test]
    async fn join_without_channels_sends_nothing() {
        let (d, t) = bound("b1").await;
        d.handle_change(change("b2", Action::Join, &[])).await;
        assert_eq!(t.queued("$network.b2"), 0);
    }
}

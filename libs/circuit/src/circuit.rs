use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use circuit_core::channel::direct_channel;
use circuit_core::{
    request_handler, subscribe_handler, Envelope, Error, RequestHandler, Result,
    SubscribeHandler, Subscription, Transport,
};
use circuit_fabric::MemoryTransport;

use crate::directory::Directory;
use crate::link::Link;
use crate::options::{RequestOptions, RespondOptions, DEFAULT_REQUEST_TTL};
use crate::router::Router;

/// Per-connection state, built by `connect` and dropped by `disconnect`
#[derive(Clone)]
struct Session {
    link: Link,
    directory: Directory,
    router: Arc<Router>,
}

/// A participant on the fabric: transport, directory and router behind
/// one facade
pub struct Circuit {
    id: String,
    transport: Arc<dyn Transport>,
    request_ttl: Duration,
    session: RwLock<Option<Session>>,
    /// Channels this circuit registered, for the `remove` on disconnect
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Circuit {
    /// Circuit with an explicit id on a given transport
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::builder().id(id).transport(transport).build()
    }

    /// Create a builder for configuring the circuit
    pub fn builder() -> CircuitBuilder {
        CircuitBuilder::new()
    }

    /// Unique id of this circuit, also the prefix of its direct channels
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport carrying this circuit's traffic
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether `connect` succeeded and no `disconnect` followed
    pub fn is_connected(&self) -> bool {
        self.session_slot().is_some()
    }

    fn session_slot(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<Session> {
        self.session_slot().as_ref().cloned().ok_or(Error::NotConnected)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, channel: &str, subscription: Subscription) {
        self.subscriptions()
            .entry(channel.to_string())
            .or_default()
            .push(subscription);
    }

    /// This circuit's channel directory
    pub fn directory(&self) -> Result<Directory> {
        Ok(self.session()?.directory)
    }

    /// This circuit's request router
    pub fn router(&self) -> Result<Arc<Router>> {
        Ok(self.session()?.router)
    }

    /// Channels this circuit subscribed or responds to
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Join the fabric
    ///
    /// Connects the transport unless it already is, then binds a fresh
    /// directory (announcing the join) and router.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }

        let link = Link::new(self.id.clone(), self.transport.clone());
        let directory = Directory::bind(link.clone()).await?;
        let router = Arc::new(Router::bind(link.clone()).await?);

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Session {
            link,
            directory,
            router,
        });

        debug!(circuit = %self.id, "Circuit connected");
        Ok(())
    }

    /// Leave the fabric
    ///
    /// Fails outstanding requests, announces the removal of every
    /// registered channel and disconnects the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::NotConnected)?;

        session.router.disconnect();

        let channels: Vec<String> = self.subscriptions().drain().map(|(c, _)| c).collect();
        if self.transport.is_connected() {
            // The transport is closed even when the removal cannot be announced
            let announced = session.directory.deregister(&channels).await;
            if let Err(e) = &announced {
                warn!(circuit = %self.id, error = %e, "Channel removal not announced");
            }
            self.transport.disconnect().await?;
            announced?;
        }

        debug!(circuit = %self.id, "Circuit disconnected");
        Ok(())
    }

    /// Run `handler` for every envelope published on `channel`
    pub async fn subscribe<F, Fut>(&self, channel: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with(channel, subscribe_handler(handler)).await
    }

    /// [`subscribe`](Self::subscribe) with an already boxed handler
    pub async fn subscribe_with(
        &self,
        channel: &str,
        handler: SubscribeHandler,
    ) -> Result<Subscription> {
        let session = self.session()?;
        let subscription = Subscription::new(handler);

        self.transport.subscribe(channel, subscription.clone()).await?;
        self.track(channel, subscription.clone());
        session.directory.register([channel]).await?;

        Ok(subscription)
    }

    /// Publish a value to every holder of `channel`
    pub async fn publish<T>(&self, channel: &str, content: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish_envelope(channel, Envelope::with_content(content)?).await
    }

    /// Publish a prepared envelope
    ///
    /// Channel and sender are overwritten. Addressing fields that only
    /// make sense for direct replies (`recipient`, `reply_for`) are cleared.
    pub async fn publish_envelope(&self, channel: &str, mut envelope: Envelope) -> Result<()> {
        envelope.recipient = None;
        envelope.reply_for = None;
        self.session()?.link.publish(channel, envelope).await
    }

    /// Call a remote responder of `channel` and decode its answer
    ///
    /// The owner is picked round robin by the directory. Fails with
    /// `NotFound` when nobody is known to own the channel and `Timeout`
    /// when no reply arrives within the TTL.
    pub async fn request<I, O>(
        &self,
        channel: &str,
        content: &I,
        options: RequestOptions,
    ) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let session = self.session()?;

        let mut request = Envelope::with_content(content)?;
        request.sender = self.id.clone();
        request.channel = channel.to_string();
        request.recipient = Some(session.directory.find(channel)?);

        let ttl = options.ttl.unwrap_or(self.request_ttl);
        let response = session.router.create_request_handler(request, ttl).await?;
        response.content_as()
    }

    /// Answer requests on `channel` with `handler`
    ///
    /// The handler's value is serialized into the reply. Requests are
    /// delivered on `<circuit id>.<channel>`.
    pub async fn respond<F, Fut, O>(
        &self,
        channel: &str,
        handler: F,
        options: RespondOptions,
    ) -> Result<Subscription>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Serialize + Send + 'static,
    {
        let handler = request_handler(move |request| {
            let answer = handler(request);
            async move { Ok(serde_json::to_value(answer.await?)?) }
        });
        self.respond_with(channel, handler, options).await
    }

    /// [`respond`](Self::respond) with an already boxed handler
    pub async fn respond_with(
        &self,
        channel: &str,
        handler: RequestHandler,
        options: RespondOptions,
    ) -> Result<Subscription> {
        let session = self.session()?;
        let subscription = Subscription::new(session.router.create_responder(handler, &options));

        self.transport
            .subscribe(&direct_channel(&self.id, channel), subscription.clone())
            .await?;
        self.track(channel, subscription.clone());
        session.directory.register([channel]).await?;

        Ok(subscription)
    }
}

/// Builder for configuring a circuit
pub struct CircuitBuilder {
    id: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    request_ttl: Duration,
}

impl Default for CircuitBuilder {
    fn default() -> Self {
        Self {
            id: None,
            transport: None,
            request_ttl: DEFAULT_REQUEST_TTL,
        }
    }
}

impl CircuitBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the circuit id (a random UUID by default)
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the transport (a private in-memory transport by default)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the TTL used by requests that do not carry their own
    pub fn request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    /// Build the circuit; nothing is connected yet
    pub fn build(self) -> Circuit {
        Circuit {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(MemoryTransport::new())),
            request_ttl: self.request_ttl,
            session: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }
}

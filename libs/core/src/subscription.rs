use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::Result;

/// Fire-and-forget handler invoked for every delivered envelope
pub type SubscribeHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Value-returning handler answering an RPC request
pub type RequestHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Box an async closure into a [`SubscribeHandler`]
pub fn subscribe_handler<F, Fut>(handler: F) -> SubscribeHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| handler(envelope).boxed())
}

/// Box an async closure into a [`RequestHandler`]
pub fn request_handler<F, Fut>(handler: F) -> RequestHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |envelope| handler(envelope).boxed())
}

/// Unique handle binding an id to a handler
#[derive(Clone)]
pub struct Subscription {
    id: String,
    handler: SubscribeHandler,
}

impl Subscription {
    /// Subscription with a fresh id
    pub fn new(handler: SubscribeHandler) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            handler,
        }
    }

    /// Identity used for equality between clones
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the handler for one envelope
    pub async fn deliver(&self, envelope: Envelope) {
        (self.handler)(envelope).await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscription {}

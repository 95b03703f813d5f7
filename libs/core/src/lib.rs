//! Circuit Core - Shared vocabulary of the circuit fabric
//!
//! Defines the envelope and subscription records, the handler types, the
//! transport and serializer capabilities and the error type every other
//! layer builds on.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod serializer;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use serializer::Serializer;
pub use subscription::{
    request_handler, subscribe_handler, RequestHandler, SubscribeHandler, Subscription,
};
pub use transport::Transport;

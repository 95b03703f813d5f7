//! Circuit Fabric - Transports and codecs for the circuit overlay
//!
//! Provides the in-process [`MemoryTransport`], a TCP pub/sub [`Broker`]
//! with its [`TcpTransport`] client, the bincode frame codec and the JSON
//! envelope serializer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use circuit_core::{subscribe_handler, Envelope, Subscription, Transport};
//! use circuit_fabric::{Broker, TcpTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::bind("127.0.0.1:0".parse()?).await?;
//! let addr = broker.local_addr()?;
//! broker.spawn();
//!
//! let transport = Arc::new(TcpTransport::new(addr));
//! transport.connect().await?;
//! transport
//!     .subscribe("greetings", Subscription::new(subscribe_handler(|msg| async move {
//!         println!("{:?}", msg.content);
//!     })))
//!     .await?;
//! transport.publish("greetings", Envelope::with_content(&"hello")?).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod delivery;
pub mod serializer;
pub mod transport;

// Re-exports for convenience
pub use serializer::JsonSerializer;
pub use transport::{Broker, MemoryTransport, TcpTransport, TcpTransportBuilder};

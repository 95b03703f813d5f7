//! Circuit - Service discovery, pub/sub and RPC over any transport
//!
//! A [`Circuit`] joins a fabric through a [`Transport`], keeps a gossiped
//! [`Directory`] of which circuits own which channels, and routes
//! request/reply calls through its [`Router`]. There is no central
//! coordinator; every circuit holds its own eventually-consistent view.
//!
//! # Example
//!
//! ```no_run
//! use circuit::{Circuit, RequestOptions, RespondOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Sum { a: i64, b: i64 }
//!
//! # async fn example() -> circuit::Result<()> {
//! let circuit = Circuit::builder().id("calc").build();
//! circuit.connect().await?;
//!
//! circuit
//!     .respond(
//!         "sum",
//!         |msg| async move {
//!             let Sum { a, b } = msg.content_as()?;
//!             Ok(a + b)
//!         },
//!         RespondOptions::default(),
//!     )
//!     .await?;
//!
//! let total: i64 = circuit
//!     .request("sum", &Sum { a: 1, b: 2 }, RequestOptions::default())
//!     .await?;
//! assert_eq!(total, 3);
//!
//! circuit.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod directory;
mod link;
pub mod options;
pub mod router;

// Re-exports for convenience
pub use circuit::{Circuit, CircuitBuilder};
pub use circuit_core::{Envelope, Error, Result, Subscription, Transport};
pub use directory::{Action, Directory, NetworkChange};
pub use options::{RequestOptions, RespondOptions, DEFAULT_REQUEST_TTL};
pub use router::Router;

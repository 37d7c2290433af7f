//! Courier - AMQP client convenience layer
//!
//! Declare the queues and events a service produces and consumes, call
//! `publish`/`subscribe` at any time, and let the client buffer those calls
//! until the broker connection, channel and topology are ready.
//!
//! ```no_run
//! use courier::{Ack, ClientOptions, Courier, Handler};
//!
//! # async fn run() -> courier::Result<()> {
//! let config = ClientOptions::new("localhost", "guest", "guest")
//!     .with_queues(["jobs"])
//!     .validate()?;
//! let client = Courier::amqp(config);
//!
//! client.publish("jobs", r#"{"id":1}"#).await?;
//! client
//!     .subscribe("jobs", Handler::from_fn("worker", |job, ack: Ack| async move {
//!         println!("{job}");
//!         ack.ack().await;
//!     }))
//!     .await?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod payload;
pub mod pending;
pub mod registry;
pub mod router;
pub mod transport;
pub mod utils;

pub use client::{ConnectionState, Courier};
pub use config::{ClientConfig, ClientOptions, QueueDefinition, QueueSpec};
pub use delivery::{Ack, Handler, MessageHandler};
pub use error::{CourierError, Result};
pub use events::{ClientEvent, Fault, FaultKind};
pub use payload::Payload;

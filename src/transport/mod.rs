//! Broker transport seam.
//!
//! The client never speaks the wire protocol itself. It drives three traits:
//! - `Transport`: opens a `Connection` from a URI
//! - `Connection`: creates channels, reports faults, closes
//! - `Channel`: topology declaration, publish, consume, ack, cancel
//!
//! Implementations:
//! - `amqp::AmqpTransport`: RabbitMQ via lapin (feature `amqp`)
//! - `mock::MockTransport`: in-memory recorder for tests

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::{CourierError, Result};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use mock::{ConnectGate, MockOperation, MockTransport, TransportCall};

/// Callback invoked with a description of an asynchronous transport fault.
pub type ErrorListener = Arc<dyn Fn(String) + Send + Sync>;

/// Callback invoked for each delivery on a consumer.
///
/// `None` means the broker cancelled the consumer.
pub type DeliveryCallback =
    Arc<dyn Fn(Option<InboundMessage>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Raw message body.
    pub body: Bytes,
}

impl InboundMessage {
    pub fn new(delivery_tag: u64, body: impl Into<Bytes>) -> Self {
        Self {
            delivery_tag,
            body: body.into(),
        }
    }
}

/// Exchange routing type. Event topology only uses fanout exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue declaration options.
///
/// Also the `options` shape accepted for entries in the client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Restrict the queue to the declaring connection.
    pub exclusive: bool,
    /// Delete once the last consumer goes away.
    pub auto_delete: bool,
    /// Idle expiry in milliseconds (`x-expires`).
    pub expires_ms: Option<u64>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            expires_ms: None,
        }
    }
}

/// Exchange declaration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

impl From<&QueueOptions> for ExchangeOptions {
    fn from(opts: &QueueOptions) -> Self {
        Self {
            durable: opts.durable,
            auto_delete: opts.auto_delete,
        }
    }
}

/// Options for direct queue sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Ask the broker to write the message to disk.
    pub persistent: bool,
}

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the broker at `uri`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>>;
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Register a listener for faults that occur after the connection is open.
    fn on_error(&self, listener: ErrorListener);

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

/// A channel on an open connection.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Limit unacknowledged deliveries per consumer.
    async fn prefetch(&self, count: u16) -> Result<()>;

    /// Declare a queue, creating it if absent.
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()>;

    /// Declare an exchange, creating it if absent.
    async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Send directly to a queue through the default exchange.
    async fn send_to_queue(&self, queue: &str, payload: Bytes, options: SendOptions)
        -> Result<()>;

    /// Publish to an exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()>;

    /// Start a consumer; returns the consumer tag the broker registered.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        on_message: DeliveryCallback,
    ) -> Result<String>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negatively acknowledge a delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Cancel a consumer.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Register a listener for faults that occur after the channel is open.
    fn on_error(&self, listener: ErrorListener);

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// Run a transport call, bounded by `timeout` when one is configured.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    timeout: Option<Duration>,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| CourierError::Timeout {
                operation,
                elapsed: limit,
            })?,
        None => call.await,
    }
}

//! Inbound message handling.
//!
//! Handlers receive the decoded JSON payload together with an `Ack` handle.
//! Calling `Ack::ack` acknowledges the delivery exactly once; the handle is
//! consumed, so a second ack cannot be written.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::events::{EventEmitter, FaultKind};
use crate::transport::{Channel, DeliveryCallback, InboundMessage};

/// Processes messages consumed from a queue or event.
pub trait MessageHandler: Send + Sync {
    /// Name embedded in consumer tags.
    fn name(&self) -> &str;

    /// Process one message. Call `ack.ack()` once processing succeeded.
    fn handle(&self, payload: Value, ack: Ack) -> BoxFuture<'static, ()>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value, Ack) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, payload: Value, ack: Ack) -> BoxFuture<'static, ()> {
        (self.f)(payload, ack).boxed()
    }
}

/// Shared handle to a message handler.
///
/// Clones compare equal; two handles built separately never do, even from
/// the same function. Keep a clone to unsubscribe a specific handler later.
#[derive(Clone)]
pub struct Handler(Arc<dyn MessageHandler>);

impl Handler {
    pub fn new(handler: impl MessageHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }

    /// Build a handler from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, Ack) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(FnHandler {
            name: name.into(),
            f,
        })
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Identity comparison.
    pub fn same_as(&self, other: &Handler) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }

    fn handle(&self, payload: Value, ack: Ack) -> BoxFuture<'static, ()> {
        self.0.handle(payload, ack)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.name()).finish()
    }
}

/// The channel currently owned by the client, if any.
///
/// Shared with every `Ack` so acks can detect a closed client without
/// touching the client's own lock.
#[derive(Clone, Default)]
pub(crate) struct ChannelSlot(Arc<RwLock<Option<Arc<dyn Channel>>>>);

impl ChannelSlot {
    pub(crate) async fn get(&self) -> Option<Arc<dyn Channel>> {
        self.0.read().await.clone()
    }

    pub(crate) async fn set(&self, channel: Arc<dyn Channel>) {
        *self.0.write().await = Some(channel);
    }

    pub(crate) async fn clear(&self) -> Option<Arc<dyn Channel>> {
        self.0.write().await.take()
    }
}

/// Acknowledgement handle for one delivery.
pub struct Ack {
    delivery_tag: u64,
    channel: ChannelSlot,
    events: EventEmitter,
}

impl Ack {
    pub(crate) fn new(delivery_tag: u64, channel: ChannelSlot, events: EventEmitter) -> Self {
        Self {
            delivery_tag,
            channel,
            events,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge the delivery.
    ///
    /// If the client's channel is gone, or the broker rejects the ack, an
    /// error event is emitted instead of failing the caller.
    pub async fn ack(self) {
        match self.channel.get().await {
            Some(channel) => {
                debug!(delivery_tag = self.delivery_tag, "Acking message");
                if let Err(e) = channel.ack(self.delivery_tag).await {
                    self.events.fault(FaultKind::Ack, e.to_string());
                }
            }
            None => {
                debug!(
                    delivery_tag = self.delivery_tag,
                    "Cannot ack, channel does not exist"
                );
                self.events
                    .fault(FaultKind::Ack, "Cannot ack. Channel does not exist");
            }
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

/// Adapt a handler into a transport delivery callback.
///
/// - `None` (broker-side cancel) never reaches the handler.
/// - Bodies that are not JSON are rejected without requeue and reported as
///   a `Decode` fault; the handler is not called.
pub(crate) fn wrap_for_ack(
    handler: Handler,
    channel: ChannelSlot,
    events: EventEmitter,
) -> DeliveryCallback {
    Arc::new(move |message: Option<InboundMessage>| {
        let handler = handler.clone();
        let channel = channel.clone();
        let events = events.clone();
        async move {
            let Some(message) = message else {
                debug!(handler = handler.name(), "Consumer cancelled by broker");
                return;
            };

            match serde_json::from_slice::<Value>(&message.body) {
                Ok(payload) => {
                    let ack = Ack::new(message.delivery_tag, channel, events);
                    handler.handle(payload, ack).await;
                }
                Err(e) => {
                    events.fault(
                        FaultKind::Decode,
                        format!("delivery {} is not JSON: {}", message.delivery_tag, e),
                    );
                    if let Some(channel) = channel.get().await {
                        if let Err(e) = channel.nack(message.delivery_tag, false).await {
                            events.fault(FaultKind::Ack, e.to_string());
                        }
                    }
                }
            }
        }
        .boxed()
    })
}

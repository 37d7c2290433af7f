//! Event routing.
//!
//! Published events are fanout exchanges named after the event. Each service
//! subscribing to an event gets its own durable queue, `{service}.{event}`,
//! bound to that exchange with an empty routing key, so every subscribed
//! service receives every event while instances of one service share work.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::{ClientConfig, QueueSpec};
use crate::error::{CourierError, Result};
use crate::transport::{bounded, Channel, DeliveryCallback, ExchangeKind, ExchangeOptions};

/// Maps event names onto exchange and queue primitives.
#[derive(Clone)]
pub struct EventRouter {
    service_name: String,
    published: Vec<QueueSpec>,
    subscribed: Vec<QueueSpec>,
    timeout: Option<Duration>,
    channel: Option<Arc<dyn Channel>>,
}

impl EventRouter {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            service_name: config.name().to_string(),
            published: config.published_events().to_vec(),
            subscribed: config.subscribed_events().to_vec(),
            timeout: config.operation_timeout(),
            channel: None,
        }
    }

    pub fn set_channel(&mut self, channel: Arc<dyn Channel>) {
        self.channel = Some(channel);
    }

    pub fn clear_channel(&mut self) {
        self.channel = None;
    }

    pub fn is_publish_event(&self, name: &str) -> bool {
        self.published.iter().any(|e| e.name == name)
    }

    pub fn is_subscribe_event(&self, name: &str) -> bool {
        self.subscribed.iter().any(|e| e.name == name)
    }

    /// Queue this service consumes `event` from.
    pub fn event_queue_name(&self, event: &str) -> String {
        format!("{}.{}", self.service_name, event)
    }

    fn channel(&self, operation: &str) -> Result<&Arc<dyn Channel>> {
        self.channel.as_ref().ok_or_else(|| {
            CourierError::ChannelUnavailable(format!("{} requires an open channel", operation))
        })
    }

    /// Declare a durable fanout exchange for every published event.
    pub async fn declare_exchanges(&self) -> Result<()> {
        let channel = self.channel("declare exchanges")?;
        for event in &self.published {
            debug!(exchange = %event.name, "Declaring fanout exchange");
            bounded(
                "assert exchange",
                self.timeout,
                channel.assert_exchange(
                    &event.name,
                    ExchangeKind::Fanout,
                    &ExchangeOptions::from(&event.options),
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Declare `{service}.{event}` for every subscribed event and bind it to
    /// the event's exchange.
    pub async fn declare_and_bind_queues(&self) -> Result<()> {
        let channel = self.channel("declare event queues")?;
        for event in &self.subscribed {
            let queue = self.event_queue_name(&event.name);
            bounded(
                "assert queue",
                self.timeout,
                channel.assert_queue(&queue, &event.options),
            )
            .await?;
            bounded(
                "bind queue",
                self.timeout,
                channel.bind_queue(&queue, &event.name, ""),
            )
            .await?;
            info!(queue = %queue, exchange = %event.name, "Bound event queue");
        }
        Ok(())
    }

    /// Publish to the event's exchange.
    pub async fn publish(&self, event: &str, payload: Bytes, routing_key: &str) -> Result<()> {
        let channel = self.channel("publish event")?;
        debug!(exchange = %event, routing_key = %routing_key, "Publishing event");
        bounded(
            "publish",
            self.timeout,
            channel.publish(event, routing_key, payload),
        )
        .await
    }

    /// Consume from this service's queue for `event`.
    pub async fn subscribe(
        &self,
        event: &str,
        consumer_tag: &str,
        on_message: DeliveryCallback,
    ) -> Result<String> {
        let channel = self.channel("subscribe to event")?;
        let queue = self.event_queue_name(event);
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consuming event queue");
        bounded(
            "consume",
            self.timeout,
            channel.consume(&queue, consumer_tag, on_message),
        )
        .await
    }
}

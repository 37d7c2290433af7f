//! AMQP (RabbitMQ) transport implementation.
//!
//! Thin adapter from the transport traits onto lapin. One lapin channel backs
//! each `AmqpChannel`; every consumer gets its own task draining the lapin
//! consumer stream into the delivery callback.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, ConnectionProperties,
};
use tracing::{debug, error, info, warn};

use super::{
    Channel, Connection, DeliveryCallback, ErrorListener, ExchangeKind, ExchangeOptions,
    InboundMessage, QueueOptions, SendOptions, Transport,
};
use crate::error::{CourierError, Result};

const CONNECTION_NAME: &str = "courier";
const CONTENT_TYPE: &str = "application/json";
/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Transport that connects to RabbitMQ through lapin.
#[derive(Clone)]
pub struct AmqpTransport {
    properties: ConnectionProperties,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self {
            properties: ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into()),
        }
    }
}

impl Default for AmqpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>> {
        let connection = lapin::Connection::connect(uri, self.properties.clone()).await?;
        info!("Connected to AMQP");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self.inner.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        debug!(channel_id = channel.id(), "Created channel with publisher confirms");
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn on_error(&self, listener: ErrorListener) {
        self.inner
            .on_error(move |err: lapin::Error| listener(err.to_string()));
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await?;
        Ok(())
    }

    async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.inner
            .exchange_declare(
                exchange,
                lapin_exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(delivery_mode(options.persistent));
        let confirmation = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        confirmed(confirmation, queue)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        let properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        let confirmation = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await?
            .await?;
        confirmed(confirmation, exchange)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        on_message: DeliveryCallback,
    ) -> Result<String> {
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let tag = consumer.tag().to_string();
        let queue = queue.to_string();

        tokio::spawn({
            let tag = tag.clone();
            async move {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            let message =
                                InboundMessage::new(delivery.delivery_tag, delivery.data);
                            on_message(Some(message)).await;
                        }
                        Err(e) => {
                            error!(queue = %queue, consumer_tag = %tag, error = %e, "Consumer delivery error");
                            break;
                        }
                    }
                }
                debug!(queue = %queue, consumer_tag = %tag, "Consumer stream ended");
                on_message(None).await;
            }
        });

        Ok(tag)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    fn on_error(&self, listener: ErrorListener) {
        let channel_id = self.inner.id();
        self.inner.on_error(move |err: lapin::Error| {
            warn!(channel_id, error = %err, "Channel error");
            listener(err.to_string())
        });
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

/// Queue declaration arguments; only `x-expires` is supported.
fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(expires) = options.expires_ms {
        args.insert(
            "x-expires".into(),
            AMQPValue::LongLongInt(expires.min(i64::MAX as u64) as i64),
        );
    }
    args
}

/// Broker nacks fail the publish; an ack or an unconfirmed channel passes.
fn confirmed(confirmation: Confirmation, target: &str) -> Result<()> {
    if confirmation.is_nack() {
        return Err(CourierError::Transport(format!(
            "broker rejected message for {}",
            target
        )));
    }
    Ok(())
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// AMQP delivery mode: 2 is persistent, 1 is transient.
fn delivery_mode(persistent: bool) -> u8 {
    if persistent {
        2
    } else {
        1
    }
}

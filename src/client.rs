//! Client facade.
//!
//! `Courier` owns the connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Channeling -> PopulatingTopology -> Ready
//!       ^                                                              |
//!       +---------------------- close / failure -----------------------+
//! ```
//!
//! Publishes and subscribes issued before `Ready` are buffered and flushed
//! during the ready transition, before `connect` returns. After that they go
//! straight to the channel.
//!
//! A connection or channel fault reported by the transport drops the client
//! back to `Disconnected`; the next `connect` opens a fresh connection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::delivery::{self, ChannelSlot, Handler};
use crate::error::{CourierError, Result};
use crate::events::{ClientEvent, EventEmitter, FaultKind};
use crate::payload::Payload;
use crate::pending::PendingOperationBuffer;
use crate::registry::{consumer_tag, ConsumerRegistry};
use crate::router::EventRouter;
use crate::transport::{
    bounded, Channel, Connection, DeliveryCallback, ErrorListener, InboundMessage, SendOptions,
    Transport,
};

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Channeling,
    PopulatingTopology,
    Ready,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Channeling => "channeling",
            ConnectionState::PopulatingTopology => "populating_topology",
            ConnectionState::Ready => "ready",
        }
    }

    fn in_progress(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Channeling
                | ConnectionState::PopulatingTopology
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    state: ConnectionState,
    /// Bumped on every connect attempt so a stale attempt cannot touch a newer one.
    attempt: u64,
    connection: Option<Arc<dyn Connection>>,
    channel: Option<Arc<dyn Channel>>,
    pending: PendingOperationBuffer,
    registry: ConsumerRegistry,
    router: EventRouter,
}

struct Shared {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    slot: ChannelSlot,
    events: EventEmitter,
    state_tx: watch::Sender<ConnectionState>,
}

/// Broker client handle.
///
/// Cloning is cheap; clones share the same connection, buffers and consumers.
#[derive(Clone)]
pub struct Courier {
    shared: Arc<Shared>,
}

impl Courier {
    /// Create a disconnected client over `transport`.
    pub fn new(config: ClientConfig, transport: impl Transport + 'static) -> Self {
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Inner {
            state: ConnectionState::Disconnected,
            attempt: 0,
            connection: None,
            channel: None,
            pending: PendingOperationBuffer::new(),
            registry: ConsumerRegistry::new(),
            router: EventRouter::new(&config),
        };
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                inner: Mutex::new(inner),
                slot: ChannelSlot::default(),
                events: EventEmitter::new(),
                state_tx,
            }),
        }
    }

    /// Create a disconnected client speaking AMQP through lapin.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: ClientConfig) -> Self {
        Self::new(config, crate::transport::AmqpTransport::new())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Every configured queue and event name.
    pub fn queues(&self) -> Vec<String> {
        self.shared.config.queue_names()
    }

    /// Subscribe to `ready` and `error` signals.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of publishes waiting for the ready transition.
    pub async fn pending_publishes(&self) -> usize {
        self.shared.inner.lock().await.pending.publish_len()
    }

    /// Number of subscribes waiting for the ready transition.
    pub async fn pending_subscribes(&self) -> usize {
        self.shared.inner.lock().await.pending.subscribe_len()
    }

    /// Tags of consumers active on the broker, oldest first.
    pub async fn consumer_tags(&self) -> Vec<String> {
        self.shared.inner.lock().await.registry.tags()
    }

    /// Adapt `handler` into a transport delivery callback bound to this
    /// client's channel and event stream.
    pub fn wrap_for_ack(&self, handler: Handler) -> DeliveryCallback {
        delivery::wrap_for_ack(
            handler,
            self.shared.slot.clone(),
            self.shared.events.clone(),
        )
    }

    fn transition(&self, inner: &mut Inner, to: ConnectionState) {
        debug!(from = %inner.state, to = %to, "State transition");
        inner.state = to;
        self.shared.state_tx.send_replace(to);
    }

    /// Connect, open a channel, declare topology and flush buffered calls.
    ///
    /// Returns immediately when already ready. A call made while another
    /// connect is in progress waits for that attempt and shares its outcome.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Disconnected => {
                    inner.attempt += 1;
                    self.transition(&mut inner, ConnectionState::Connecting);
                    inner.attempt
                }
                _ => {
                    let rx = self.shared.state_tx.subscribe();
                    drop(inner);
                    return wait_for_outcome(rx).await;
                }
            }
        };

        match self.establish(attempt).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Connect failed");
                self.reset_after_failure(attempt).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, attempt: u64) -> Result<()> {
        let config = &self.shared.config;
        let timeout = config.operation_timeout();

        info!(host = %config.hostname(), service = %config.name(), "Connecting to broker");
        let connection = bounded(
            "connect",
            timeout,
            self.shared.transport.connect(&config.connection_uri()),
        )
        .await?;
        connection.on_error(self.fault_listener(FaultKind::Connection, attempt));

        {
            let mut inner = self.shared.inner.lock().await;
            if !owns(&inner, attempt, ConnectionState::Connecting) {
                drop(inner);
                if let Err(e) = connection.close().await {
                    debug!(error = %e, "Closing abandoned connection failed");
                }
                return Err(CourierError::ConnectionAborted);
            }
            inner.connection = Some(Arc::clone(&connection));
            self.transition(&mut inner, ConnectionState::Channeling);
        }

        let channel = bounded("create channel", timeout, connection.create_channel()).await?;
        channel.on_error(self.fault_listener(FaultKind::Channel, attempt));
        if let Some(count) = config.prefetch() {
            bounded("prefetch", timeout, channel.prefetch(count)).await?;
        }

        let router = {
            let mut inner = self.shared.inner.lock().await;
            if !owns(&inner, attempt, ConnectionState::Channeling) {
                return Err(CourierError::ConnectionAborted);
            }
            inner.channel = Some(Arc::clone(&channel));
            inner.router.set_channel(Arc::clone(&channel));
            self.shared.slot.set(Arc::clone(&channel)).await;
            self.transition(&mut inner, ConnectionState::PopulatingTopology);
            inner.router.clone()
        };

        for spec in config.queues() {
            debug!(queue = %spec.name, "Declaring queue");
            bounded(
                "assert queue",
                timeout,
                channel.assert_queue(&spec.name, &config.plain_queue_options(spec)),
            )
            .await?;
        }
        router.declare_exchanges().await?;
        router.declare_and_bind_queues().await?;

        let mut inner = self.shared.inner.lock().await;
        if !owns(&inner, attempt, ConnectionState::PopulatingTopology) {
            return Err(CourierError::ConnectionAborted);
        }
        self.transition(&mut inner, ConnectionState::Ready);
        info!(queues = ?config.queue_names(), "Client ready");
        self.flush(&mut inner).await;
        drop(inner);

        self.shared.events.ready();
        Ok(())
    }

    /// Undo a failed attempt: drop the channel and connection, go back to
    /// `Disconnected`. Buffered calls are kept for the next attempt.
    async fn reset_after_failure(&self, attempt: u64) {
        let connection = {
            let mut inner = self.shared.inner.lock().await;
            if inner.attempt != attempt || !inner.state.in_progress() {
                return;
            }
            inner.channel = None;
            inner.router.clear_channel();
            self.transition(&mut inner, ConnectionState::Disconnected);
            inner.connection.take()
        };
        self.shared.slot.clear().await;

        if let Some(connection) = connection {
            let timeout = self.shared.config.operation_timeout();
            if let Err(e) = bounded("close connection", timeout, connection.close()).await {
                warn!(error = %e, "Failed to close half-open connection");
            }
        }
    }

    /// Listener that reports a transport fault and then drops the connection
    /// of `attempt`.
    ///
    /// Transports may call listeners from their own threads, so the reset is
    /// spawned on the runtime that opened the connection.
    fn fault_listener(&self, kind: FaultKind, attempt: u64) -> ErrorListener {
        let shared = Arc::downgrade(&self.shared);
        let runtime = Handle::try_current().ok();
        Arc::new(move |reason: String| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.events.fault(kind, reason);
            let client = Courier { shared };
            match &runtime {
                Some(runtime) => {
                    runtime.spawn(async move { client.reset_after_fault(attempt).await });
                }
                None => warn!("No runtime available to reset after transport fault"),
            }
        })
    }

    /// Go back to `Disconnected` after a transport fault on `attempt`.
    ///
    /// Consumers died with the channel and are forgotten. Buffered calls are
    /// kept. Faults from an older attempt, or after `close`, are ignored.
    async fn reset_after_fault(&self, attempt: u64) {
        let (channel, connection) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.attempt != attempt || inner.state == ConnectionState::Disconnected {
                return;
            }
            warn!(state = %inner.state, "Transport fault, disconnecting");
            inner.router.clear_channel();
            inner.registry.clear();
            self.shared.slot.clear().await;
            self.transition(&mut inner, ConnectionState::Disconnected);
            (inner.channel.take(), inner.connection.take())
        };

        let timeout = self.shared.config.operation_timeout();
        if let Some(channel) = channel {
            if let Err(e) = bounded("close channel", timeout, channel.close()).await {
                debug!(error = %e, "Closing faulted channel failed");
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = bounded("close connection", timeout, connection.close()).await {
                debug!(error = %e, "Closing faulted connection failed");
            }
        }
    }

    async fn flush(&self, inner: &mut Inner) {
        let (publishes, subscribes) = inner.pending.drain();
        if publishes.is_empty() && subscribes.is_empty() {
            return;
        }
        info!(
            publishes = publishes.len(),
            subscribes = subscribes.len(),
            "Flushing buffered operations"
        );

        for op in publishes {
            if let Err(e) = self.dispatch_publish(inner, &op.queue, op.payload).await {
                self.shared.events.fault(
                    FaultKind::Dispatch,
                    format!("buffered publish to {} failed: {}", op.queue, e),
                );
            }
        }
        for op in subscribes {
            if let Err(e) = self.dispatch_subscribe(inner, &op.queue, op.handler).await {
                self.shared.events.fault(
                    FaultKind::Dispatch,
                    format!("buffered subscribe to {} failed: {}", op.queue, e),
                );
            }
        }
    }

    fn can_publish(&self, queue: &str) -> bool {
        let config = &self.shared.config;
        config.is_queue(queue) || config.is_published_event(queue)
    }

    fn can_subscribe(&self, queue: &str) -> bool {
        let config = &self.shared.config;
        config.is_queue(queue) || config.is_subscribed_event(queue)
    }

    /// Publish `data` to a configured queue or published event.
    ///
    /// Before the client is ready the message is buffered and `Ok` is
    /// returned once it is queued.
    pub async fn publish(&self, queue: &str, data: impl Into<Payload>) -> Result<()> {
        if !self.can_publish(queue) {
            return Err(CourierError::InvalidQueue(queue.to_string()));
        }
        let payload = data.into().into_bytes()?;

        let mut inner = self.shared.inner.lock().await;
        if inner.state != ConnectionState::Ready {
            inner.pending.enqueue_publish(queue, payload);
            return Ok(());
        }
        self.dispatch_publish(&inner, queue, payload).await
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, queue: &str, value: &T) -> Result<()> {
        if !self.can_publish(queue) {
            return Err(CourierError::InvalidQueue(queue.to_string()));
        }
        self.publish(queue, Payload::json(value)?).await
    }

    async fn dispatch_publish(&self, inner: &Inner, queue: &str, payload: Bytes) -> Result<()> {
        if inner.router.is_publish_event(queue) {
            return inner.router.publish(queue, payload, "").await;
        }

        let channel = require_channel(inner, "publish")?;
        debug!(queue = %queue, bytes = payload.len(), "Sending to queue");
        let options = SendOptions {
            persistent: self.shared.config.persistent(),
        };
        bounded(
            "send to queue",
            self.shared.config.operation_timeout(),
            channel.send_to_queue(queue, payload, options),
        )
        .await
    }

    /// Consume a configured queue or subscribed event with `handler`.
    ///
    /// Keep a clone of `handler` to unsubscribe it specifically later.
    pub async fn subscribe(&self, queue: &str, handler: Handler) -> Result<()> {
        if !self.can_subscribe(queue) {
            return Err(CourierError::InvalidQueue(queue.to_string()));
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.state != ConnectionState::Ready {
            inner.pending.enqueue_subscribe(queue, handler);
            return Ok(());
        }
        self.dispatch_subscribe(&mut inner, queue, handler).await
    }

    async fn dispatch_subscribe(
        &self,
        inner: &mut Inner,
        queue: &str,
        handler: Handler,
    ) -> Result<()> {
        let tag = consumer_tag(queue, &handler);
        let on_message =
            self.forget_on_cancel(tag.clone(), self.wrap_for_ack(handler.clone()));

        let registered = if inner.router.is_subscribe_event(queue) {
            inner.router.subscribe(queue, &tag, on_message).await?
        } else {
            let channel = require_channel(inner, "subscribe")?;
            bounded(
                "consume",
                self.shared.config.operation_timeout(),
                channel.consume(queue, &tag, on_message),
            )
            .await?
        };

        info!(queue = %queue, consumer_tag = %registered, handler = handler.name(), "Subscribed");
        inner.registry.register(registered, queue, handler);
        Ok(())
    }

    /// Wrap `on_message` so a broker-side cancel (`None`) also drops the
    /// consumer's registration.
    fn forget_on_cancel(
        &self,
        consumer_tag: String,
        on_message: DeliveryCallback,
    ) -> DeliveryCallback {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |message: Option<InboundMessage>| {
            let cancelled = message.is_none();
            let delivered = on_message(message);
            let shared = shared.clone();
            let consumer_tag = consumer_tag.clone();
            async move {
                delivered.await;
                if !cancelled {
                    return;
                }
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let removed = shared.inner.lock().await.registry.remove(&consumer_tag);
                if let Some(registration) = removed {
                    info!(
                        queue = %registration.queue,
                        consumer_tag = %consumer_tag,
                        "Consumer cancelled by broker"
                    );
                }
            }
            .boxed()
        })
    }

    /// Stop consuming `queue`, for every handler or only `handler`.
    ///
    /// Consumers are cancelled one at a time. The first failed cancel stops
    /// the loop and is returned; that consumer and any not yet reached stay
    /// registered.
    pub async fn unsubscribe(&self, queue: &str, handler: Option<&Handler>) -> Result<()> {
        if !self.can_subscribe(queue) {
            return Err(CourierError::InvalidQueue(queue.to_string()));
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.state != ConnectionState::Ready {
            inner.pending.remove_pending_subscribe(queue, handler);
            return Ok(());
        }

        let tags = inner.registry.find(queue, handler);
        if tags.is_empty() {
            debug!(queue = %queue, "Nothing to unsubscribe");
            return Ok(());
        }
        let channel = Arc::clone(require_channel(&inner, "unsubscribe")?);
        let timeout = self.shared.config.operation_timeout();

        for tag in tags {
            if let Err(e) = bounded("cancel", timeout, channel.cancel(&tag)).await {
                warn!(queue = %queue, consumer_tag = %tag, error = %e, "Cancel failed");
                return Err(e);
            }
            inner.registry.remove(&tag);
            debug!(queue = %queue, consumer_tag = %tag, "Cancelled consumer");
        }
        Ok(())
    }

    /// Close the channel, then the connection.
    ///
    /// Safe to call repeatedly. Local state is cleared even if a step fails;
    /// step failures are returned together.
    pub async fn close(&self) -> Result<()> {
        let (channel, connection) = {
            let mut inner = self.shared.inner.lock().await;
            let channel = inner.channel.take();
            let connection = inner.connection.take();
            inner.router.clear_channel();
            inner.registry.clear();
            if inner.state != ConnectionState::Disconnected {
                self.transition(&mut inner, ConnectionState::Disconnected);
            }
            (channel, connection)
        };
        self.shared.slot.clear().await;

        let timeout = self.shared.config.operation_timeout();
        let mut failures = Vec::new();

        if let Some(channel) = channel {
            if let Err(e) = bounded("close channel", timeout, channel.close()).await {
                warn!(error = %e, "Failed to close channel");
                failures.push(format!("channel: {}", e));
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = bounded("close connection", timeout, connection.close()).await {
                warn!(error = %e, "Failed to close connection");
                failures.push(format!("connection: {}", e));
            }
        }

        if failures.is_empty() {
            info!("Client closed");
            Ok(())
        } else {
            Err(CourierError::Close(failures))
        }
    }
}

fn owns(inner: &Inner, attempt: u64, expected: ConnectionState) -> bool {
    inner.attempt == attempt && inner.state == expected
}

fn require_channel<'a>(inner: &'a Inner, operation: &str) -> Result<&'a Arc<dyn Channel>> {
    inner.channel.as_ref().ok_or_else(|| {
        CourierError::ChannelUnavailable(format!("{} requires an open channel", operation))
    })
}

async fn wait_for_outcome(mut rx: watch::Receiver<ConnectionState>) -> Result<()> {
    let state = rx
        .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Disconnected))
        .await
        .map(|s| *s)
        .map_err(|_| CourierError::ConnectionAborted)?;
    match state {
        ConnectionState::Ready => Ok(()),
        _ => Err(CourierError::ConnectionAborted),
    }
}

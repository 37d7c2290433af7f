//! Mock transport implementation for testing.
//!
//! Records every call as a `TransportCall`, can fail or stall chosen
//! operations, can hold `connect` open until released, and lets tests push
//! deliveries into registered consumers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, RwLock};

use super::{
    Channel, Connection, DeliveryCallback, ErrorListener, ExchangeKind, ExchangeOptions,
    InboundMessage, QueueOptions, SendOptions, Transport,
};
use crate::error::{CourierError, Result};

/// A recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect {
        uri: String,
    },
    CreateChannel,
    Prefetch {
        count: u16,
    },
    AssertQueue {
        queue: String,
        options: QueueOptions,
    },
    AssertExchange {
        exchange: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
    },
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    SendToQueue {
        queue: String,
        payload: Bytes,
        options: SendOptions,
    },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Bytes,
    },
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Cancel {
        consumer_tag: String,
    },
    CloseChannel,
    CloseConnection,
}

/// Operations that can be told to fail or stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Connect,
    CreateChannel,
    Prefetch,
    AssertQueue,
    AssertExchange,
    BindQueue,
    SendToQueue,
    Publish,
    Consume,
    Ack,
    Nack,
    Cancel,
    CloseChannel,
    CloseConnection,
}

struct MockConsumer {
    queue: String,
    on_message: DeliveryCallback,
}

#[derive(Default)]
struct MockState {
    calls: RwLock<Vec<TransportCall>>,
    failing: RwLock<HashSet<MockOperation>>,
    /// Fail only the n-th call (1-based) of an operation.
    failing_nth: RwLock<HashMap<MockOperation, usize>>,
    counts: RwLock<HashMap<MockOperation, usize>>,
    stalled: RwLock<HashSet<MockOperation>>,
    connect_gate: RwLock<Option<Arc<Notify>>>,
    consumers: RwLock<Vec<(String, MockConsumer)>>,
    connection_listeners: Mutex<Vec<ErrorListener>>,
    channel_listeners: Mutex<Vec<ErrorListener>>,
}

impl MockState {
    async fn record(&self, op: MockOperation, call: TransportCall) -> Result<()> {
        self.calls.write().await.push(call);

        let nth = {
            let mut counts = self.counts.write().await;
            let count = counts.entry(op).or_insert(0);
            *count += 1;
            *count
        };

        if self.stalled.read().await.contains(&op) {
            std::future::pending::<()>().await;
        }

        let fail_nth = self.failing_nth.read().await.get(&op) == Some(&nth);
        if fail_nth || self.failing.read().await.contains(&op) {
            return Err(CourierError::Transport(format!("mock {:?} failure", op)));
        }
        Ok(())
    }
}

/// Handle used by tests to release a held `connect`.
#[derive(Clone)]
pub struct ConnectGate(Arc<Notify>);

impl ConnectGate {
    /// Let the pending (or next) connect complete.
    pub fn release(&self) {
        self.0.notify_one();
    }
}

/// In-memory transport for testing.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail.
    pub async fn fail_on(&self, op: MockOperation) {
        self.state.failing.write().await.insert(op);
    }

    /// Make only the `nth` call (1-based) of `op` fail.
    pub async fn fail_nth(&self, op: MockOperation, nth: usize) {
        self.state.failing_nth.write().await.insert(op, nth);
    }

    pub async fn clear_failures(&self) {
        self.state.failing.write().await.clear();
        self.state.failing_nth.write().await.clear();
    }

    /// Make every call of `op` hang forever.
    pub async fn stall_on(&self, op: MockOperation) {
        self.state.stalled.write().await.insert(op);
    }

    /// Hold `connect` open until the returned gate is released.
    pub async fn hold_connect(&self) -> ConnectGate {
        let notify = Arc::new(Notify::new());
        *self.state.connect_gate.write().await = Some(Arc::clone(&notify));
        ConnectGate(notify)
    }

    pub async fn calls(&self) -> Vec<TransportCall> {
        self.state.calls.read().await.clone()
    }

    /// Number of recorded calls satisfying `pred`.
    pub async fn count_calls(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.state.calls.read().await.iter().filter(|c| pred(c)).count()
    }

    /// Consumer tags currently active, in registration order.
    pub async fn consumer_tags(&self) -> Vec<String> {
        self.state
            .consumers
            .read()
            .await
            .iter()
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Consumer tags currently active on `queue`.
    pub async fn consumers_on(&self, queue: &str) -> Vec<String> {
        self.state
            .consumers
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.queue == queue)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Push a delivery into a consumer and wait for its callback to finish.
    ///
    /// Returns false if no consumer with that tag exists.
    pub async fn deliver(&self, consumer_tag: &str, message: Option<InboundMessage>) -> bool {
        let callback = self
            .state
            .consumers
            .read()
            .await
            .iter()
            .find(|(tag, _)| tag == consumer_tag)
            .map(|(_, c)| Arc::clone(&c.on_message));

        match callback {
            Some(on_message) => {
                on_message(message).await;
                true
            }
            None => false,
        }
    }

    /// Simulate an asynchronous connection fault.
    pub fn emit_connection_error(&self, message: &str) {
        let listeners = self
            .state
            .connection_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(message.to_string());
        }
    }

    /// Simulate an asynchronous channel fault.
    pub fn emit_channel_error(&self, message: &str) {
        let listeners = self
            .state
            .channel_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(message.to_string());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>> {
        let gate = self.state.connect_gate.write().await.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state
            .record(
                MockOperation::Connect,
                TransportCall::Connect {
                    uri: uri.to_string(),
                },
            )
            .await?;
        Ok(Arc::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        self.state
            .record(MockOperation::CreateChannel, TransportCall::CreateChannel)
            .await?;
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
        }))
    }

    fn on_error(&self, listener: ErrorListener) {
        self.state
            .connection_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    async fn close(&self) -> Result<()> {
        self.state
            .record(MockOperation::CloseConnection, TransportCall::CloseConnection)
            .await
    }
}

struct MockChannel {
    state: Arc<MockState>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn prefetch(&self, count: u16) -> Result<()> {
        self.state
            .record(MockOperation::Prefetch, TransportCall::Prefetch { count })
            .await
    }

    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        self.state
            .record(
                MockOperation::AssertQueue,
                TransportCall::AssertQueue {
                    queue: queue.to_string(),
                    options: options.clone(),
                },
            )
            .await
    }

    async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.state
            .record(
                MockOperation::AssertExchange,
                TransportCall::AssertExchange {
                    exchange: exchange.to_string(),
                    kind,
                    options: options.clone(),
                },
            )
            .await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.state
            .record(
                MockOperation::BindQueue,
                TransportCall::BindQueue {
                    queue: queue.to_string(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                },
            )
            .await
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<()> {
        self.state
            .record(
                MockOperation::SendToQueue,
                TransportCall::SendToQueue {
                    queue: queue.to_string(),
                    payload,
                    options,
                },
            )
            .await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        self.state
            .record(
                MockOperation::Publish,
                TransportCall::Publish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    payload,
                },
            )
            .await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        on_message: DeliveryCallback,
    ) -> Result<String> {
        self.state
            .record(
                MockOperation::Consume,
                TransportCall::Consume {
                    queue: queue.to_string(),
                    consumer_tag: consumer_tag.to_string(),
                },
            )
            .await?;
        self.state.consumers.write().await.push((
            consumer_tag.to_string(),
            MockConsumer {
                queue: queue.to_string(),
                on_message,
            },
        ));
        Ok(consumer_tag.to_string())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.state
            .record(MockOperation::Ack, TransportCall::Ack { delivery_tag })
            .await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.state
            .record(
                MockOperation::Nack,
                TransportCall::Nack {
                    delivery_tag,
                    requeue,
                },
            )
            .await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.state
            .record(
                MockOperation::Cancel,
                TransportCall::Cancel {
                    consumer_tag: consumer_tag.to_string(),
                },
            )
            .await?;
        self.state
            .consumers
            .write()
            .await
            .retain(|(tag, _)| tag != consumer_tag);
        Ok(())
    }

    fn on_error(&self, listener: ErrorListener) {
        self.state
            .channel_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    async fn close(&self) -> Result<()> {
        self.state
            .record(MockOperation::CloseChannel, TransportCall::CloseChannel)
            .await?;
        self.state.consumers.write().await.clear();
        Ok(())
    }
}

//! Client lifecycle tests over the in-memory transport.
//!
//! Run with: cargo test --test client_lifecycle

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use courier::transport::{
    ExchangeKind, ExchangeOptions, InboundMessage, MockOperation, MockTransport, QueueOptions,
    SendOptions, TransportCall,
};
use courier::{
    Ack, ClientEvent, ClientOptions, ConnectionState, Courier, CourierError, FaultKind, Handler,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

fn queue_client(queues: &[&str]) -> (Courier, MockTransport) {
    let config = ClientOptions::new("h", "u", "p")
        .with_port(1111)
        .with_queues(queues.iter().copied())
        .validate()
        .unwrap();
    let transport = MockTransport::new();
    (Courier::new(config, transport.clone()), transport)
}

fn event_client(
    name: &str,
    published: &[&str],
    subscribed: &[&str],
) -> (Courier, MockTransport) {
    let config = ClientOptions::new("h", "u", "p")
        .with_name(name)
        .with_published_events(published.iter().copied())
        .with_subscribed_events(subscribed.iter().copied())
        .validate()
        .unwrap();
    let transport = MockTransport::new();
    (Courier::new(config, transport.clone()), transport)
}

fn noop(name: &str) -> Handler {
    Handler::from_fn(name, |_payload, _ack| async {})
}

/// Handler that forwards every payload and acks it.
fn forwarding(name: &str) -> (Handler, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Handler::from_fn(name, move |payload, ack: Ack| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(payload);
            ack.ack().await;
        }
    });
    (handler, rx)
}

/// Let spawned fault handling finish closing the old connection.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn count(transport: &MockTransport, pred: impl Fn(&TransportCall) -> bool) -> usize {
    transport.count_calls(pred).await
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_unknown_queue_is_rejected_everywhere() {
    let (client, transport) = queue_client(&["q1"]);

    let publish = client.publish("nope", json!({})).await;
    let subscribe = client.subscribe("nope", noop("h")).await;
    let unsubscribe = client.unsubscribe("nope", None).await;

    assert!(matches!(publish, Err(CourierError::InvalidQueue(q)) if q == "nope"));
    assert!(matches!(subscribe, Err(CourierError::InvalidQueue(_))));
    assert!(matches!(unsubscribe, Err(CourierError::InvalidQueue(_))));
    assert!(transport.calls().await.is_empty());
}

#[tokio::test]
async fn test_event_direction_is_enforced() {
    let (client, _transport) = event_client("svc", &["evt.out"], &["evt.in"]);

    assert!(matches!(
        client.subscribe("evt.out", noop("h")).await,
        Err(CourierError::InvalidQueue(_))
    ));
    assert!(matches!(
        client.publish("evt.in", json!({})).await,
        Err(CourierError::InvalidQueue(_))
    ));
    assert_ok!(client.publish("evt.out", json!({})).await);
    assert_ok!(client.subscribe("evt.in", noop("h")).await);
}

#[tokio::test]
async fn test_invalid_json_text_is_rejected() {
    let (client, _transport) = queue_client(&["q1"]);
    let err = client.publish("q1", "{not json").await.unwrap_err();
    assert!(matches!(err, CourierError::InvalidPayload(_)));
    assert!(err.is_usage_error());
    assert_eq!(client.pending_publishes().await, 0);
}

// ============================================================================
// Buffering and flush
// ============================================================================

#[tokio::test]
async fn test_publish_before_connect_is_sent_once_after_ready() {
    let (client, transport) = queue_client(&["q1"]);

    client.publish("q1", json!({"a": 1})).await.unwrap();
    assert_eq!(client.pending_publishes().await, 1);
    assert!(transport.calls().await.is_empty());

    client.connect().await.unwrap();

    assert_eq!(client.pending_publishes().await, 0);
    let sends: Vec<TransportCall> = transport
        .calls()
        .await
        .into_iter()
        .filter(|c| matches!(c, TransportCall::SendToQueue { .. }))
        .collect();
    assert_eq!(
        sends,
        vec![TransportCall::SendToQueue {
            queue: "q1".to_string(),
            payload: bytes::Bytes::from_static(br#"{"a":1}"#),
            options: SendOptions { persistent: true },
        }]
    );
    assert!(transport.calls().await.contains(&TransportCall::Connect {
        uri: "amqp://u:p@h:1111?heartbeat=0".to_string()
    }));
}

#[tokio::test]
async fn test_payload_round_trip() {
    let (client, transport) = queue_client(&["q1"]);
    let data = json!({"id": 42, "tags": ["x", "y"], "nested": {"ok": true}});

    client.publish("q1", data.clone()).await.unwrap();
    client.connect().await.unwrap();

    let payload = transport
        .calls()
        .await
        .into_iter()
        .find_map(|c| match c {
            TransportCall::SendToQueue { payload, .. } => Some(payload),
            _ => None,
        })
        .unwrap();
    let decoded: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(decoded, data);
}

#[tokio::test]
async fn test_buffered_operations_flush_in_call_order() {
    let (client, transport) = queue_client(&["q1", "q2"]);

    client.publish("q1", json!({"n": 1})).await.unwrap();
    client.subscribe("q2", noop("first")).await.unwrap();
    client.publish("q2", json!({"n": 2})).await.unwrap();
    client.subscribe("q1", noop("second")).await.unwrap();

    client.connect().await.unwrap();

    let dispatched: Vec<String> = transport
        .calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            TransportCall::SendToQueue { queue, .. } => Some(format!("send:{}", queue)),
            TransportCall::Consume { queue, .. } => Some(format!("consume:{}", queue)),
            _ => None,
        })
        .collect();
    assert_eq!(
        dispatched,
        vec!["send:q1", "send:q2", "consume:q2", "consume:q1"]
    );
}

#[tokio::test]
async fn test_subscribe_before_connect_buffers_then_consumes_once() {
    let (client, transport) = queue_client(&["q1"]);

    client.subscribe("q1", noop("worker")).await.unwrap();
    assert_eq!(client.pending_subscribes().await, 1);
    assert!(transport.calls().await.is_empty());

    client.connect().await.unwrap();

    assert_eq!(client.pending_subscribes().await, 0);
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::Consume { .. })).await,
        1
    );
    assert_eq!(client.consumer_tags().await.len(), 1);
}

#[tokio::test]
async fn test_flush_failure_is_reported_and_flush_continues() {
    let (client, transport) = queue_client(&["q1"]);
    let mut events = client.events();
    transport.fail_nth(MockOperation::SendToQueue, 1).await;

    client.publish("q1", json!({"n": 1})).await.unwrap();
    client.publish("q1", json!({"n": 2})).await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::SendToQueue { .. })).await,
        2
    );
    match events.recv().await.unwrap() {
        ClientEvent::Error(fault) => assert_eq!(fault.kind, FaultKind::Dispatch),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Ready);
}

#[tokio::test]
async fn test_publish_after_ready_is_direct() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();

    client.publish("q1", json!({"late": true})).await.unwrap();

    assert_eq!(client.pending_publishes().await, 0);
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::SendToQueue { .. })).await,
        1
    );
}

#[tokio::test]
async fn test_non_persistent_config_sends_transient() {
    let config = ClientOptions::new("h", "u", "p")
        .with_queues(["q1"])
        .with_persistent(false)
        .validate()
        .unwrap();
    let transport = MockTransport::new();
    let client = Courier::new(config, transport.clone());
    client.connect().await.unwrap();
    client.publish("q1", json!(1)).await.unwrap();

    assert_eq!(
        count(&transport, |c| matches!(
            c,
            TransportCall::SendToQueue {
                options: SendOptions { persistent: false },
                ..
            }
        ))
        .await,
        1
    );
}

// ============================================================================
// Topology
// ============================================================================

#[tokio::test]
async fn test_published_event_declares_fanout_exchange_only() {
    let (client, transport) = event_client("svc", &["evt"], &[]);
    client.connect().await.unwrap();

    assert_eq!(
        count(&transport, |c| *c
            == TransportCall::AssertExchange {
                exchange: "evt".to_string(),
                kind: ExchangeKind::Fanout,
                options: ExchangeOptions {
                    durable: true,
                    auto_delete: false
                },
            })
        .await,
        1
    );
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::AssertQueue { .. })).await,
        0
    );
}

#[tokio::test]
async fn test_subscribed_event_declares_and_binds_service_queue() {
    let (client, transport) = event_client("svc2", &[], &["evt"]);
    client.connect().await.unwrap();

    let calls = transport.calls().await;
    assert!(calls.contains(&TransportCall::AssertQueue {
        queue: "svc2.evt".to_string(),
        options: QueueOptions::default(),
    }));
    assert!(calls.contains(&TransportCall::BindQueue {
        queue: "svc2.evt".to_string(),
        exchange: "evt".to_string(),
        routing_key: String::new(),
    }));
}

#[tokio::test]
async fn test_plain_queues_declared_durable_in_order() {
    let (client, transport) = queue_client(&["a", "b"]);
    client.connect().await.unwrap();

    let declared: Vec<String> = transport
        .calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            TransportCall::AssertQueue { queue, options } => {
                assert!(options.durable);
                Some(queue)
            }
            _ => None,
        })
        .collect();
    assert_eq!(declared, vec!["a", "b"]);
}

#[tokio::test]
async fn test_event_publish_goes_to_exchange() {
    let (client, transport) = event_client("svc", &["evt"], &[]);
    client.connect().await.unwrap();

    client.publish("evt", json!({"id": 1})).await.unwrap();

    assert!(transport.calls().await.contains(&TransportCall::Publish {
        exchange: "evt".to_string(),
        routing_key: String::new(),
        payload: bytes::Bytes::from_static(br#"{"id":1}"#),
    }));
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::SendToQueue { .. })).await,
        0
    );
}

#[tokio::test]
async fn test_event_subscribe_consumes_service_queue() {
    let (client, transport) = event_client("svc", &[], &["evt"]);
    client.subscribe("evt", noop("listener")).await.unwrap();
    client.connect().await.unwrap();

    let tags = transport.consumers_on("svc.evt").await;
    assert_eq!(tags.len(), 1);
    assert!(tags[0].ends_with("-evt-listener"));
    assert_eq!(client.consumer_tags().await, tags);
}

// ============================================================================
// Unsubscribe
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_all_cancels_each_consumer() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();
    client.subscribe("q1", noop("a")).await.unwrap();
    client.subscribe("q1", noop("b")).await.unwrap();
    let tags = client.consumer_tags().await;

    client.unsubscribe("q1", None).await.unwrap();

    let cancelled: Vec<String> = transport
        .calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            TransportCall::Cancel { consumer_tag } => Some(consumer_tag),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled, tags);
    assert!(client.consumer_tags().await.is_empty());
    assert!(transport.consumer_tags().await.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_specific_handler_leaves_others() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();
    let target = noop("target");
    client.subscribe("q1", noop("other")).await.unwrap();
    client.subscribe("q1", target.clone()).await.unwrap();

    client.unsubscribe("q1", Some(&target)).await.unwrap();

    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::Cancel { .. })).await,
        1
    );
    let remaining = client.consumer_tags().await;
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].ends_with("-q1-other"));
}

#[tokio::test]
async fn test_unsubscribe_stops_at_first_failed_cancel() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();
    for name in ["a", "b", "c"] {
        client.subscribe("q1", noop(name)).await.unwrap();
    }
    let tags = client.consumer_tags().await;
    transport.fail_nth(MockOperation::Cancel, 2).await;

    let err = client.unsubscribe("q1", None).await.unwrap_err();

    assert!(err.is_transport_error());
    assert_eq!(client.consumer_tags().await, tags[1..].to_vec());
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::Cancel { .. })).await,
        2
    );
}

#[tokio::test]
async fn test_unsubscribe_with_no_consumers_is_ok() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();
    client.unsubscribe("q1", None).await.unwrap();
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::Cancel { .. })).await,
        0
    );
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_delivery_reaches_handler_and_is_acked() {
    let (client, transport) = queue_client(&["q1"]);
    let (handler, mut rx) = forwarding("worker");
    client.subscribe("q1", handler).await.unwrap();
    client.connect().await.unwrap();
    let tag = client.consumer_tags().await.remove(0);

    assert!(
        transport
            .deliver(&tag, Some(InboundMessage::new(9, r#"{"job":"x"}"#)))
            .await
    );

    assert_eq!(rx.recv().await.unwrap(), json!({"job": "x"}));
    assert_eq!(
        count(&transport, |c| *c == TransportCall::Ack { delivery_tag: 9 }).await,
        1
    );
}

#[tokio::test]
async fn test_ack_after_close_emits_error_event() {
    let (client, transport) = queue_client(&["q1"]);
    let held = Arc::new(tokio::sync::Mutex::new(None));
    let held_in = Arc::clone(&held);
    let handler = Handler::from_fn("slow", move |_payload, ack: Ack| {
        let held = Arc::clone(&held_in);
        async move {
            *held.lock().await = Some(ack);
        }
    });
    client.subscribe("q1", handler).await.unwrap();
    client.connect().await.unwrap();
    let tag = client.consumer_tags().await.remove(0);
    transport
        .deliver(&tag, Some(InboundMessage::new(1, "{}")))
        .await;

    let mut events = client.events();
    client.close().await.unwrap();
    let ack = held.lock().await.take().unwrap();
    ack.ack().await;

    match events.recv().await.unwrap() {
        ClientEvent::Error(fault) => {
            assert_eq!(fault.kind, FaultKind::Ack);
            assert_eq!(fault.message, "Cannot ack. Channel does not exist");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::Ack { .. })).await,
        0
    );
}

#[tokio::test]
async fn test_broker_cancel_forgets_consumer() {
    let (client, transport) = queue_client(&["q1"]);
    let (handler, mut rx) = forwarding("worker");
    client.subscribe("q1", handler).await.unwrap();
    client.subscribe("q1", noop("other")).await.unwrap();
    client.connect().await.unwrap();
    let tags = client.consumer_tags().await;

    assert!(transport.deliver(&tags[0], None).await);

    assert_eq!(client.consumer_tags().await, vec![tags[1].clone()]);
    assert!(rx.try_recv().is_err());

    assert_ok!(client.unsubscribe("q1", None).await);
    let cancels = count(&transport, |c| matches!(c, TransportCall::Cancel { .. })).await;
    assert_eq!(cancels, 1);
}

#[tokio::test]
async fn test_wrap_for_ack_ignores_empty_delivery() {
    let (client, _transport) = queue_client(&["q1"]);
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = Arc::clone(&calls);
    let handler = Handler::from_fn("h", move |_payload, _ack| {
        calls_in.fetch_add(1, Ordering::SeqCst);
        async {}
    });

    let callback = client.wrap_for_ack(handler);
    callback(None).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Events and lifecycle
// ============================================================================

#[tokio::test]
async fn test_ready_event_after_connect() {
    let (client, _transport) = queue_client(&["q1"]);
    let mut events = client.events();
    client.connect().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Ready);
}

#[tokio::test]
async fn test_transport_faults_surface_as_error_events() {
    let (client, transport) = queue_client(&["q1"]);
    let mut events = client.events();
    client.connect().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ClientEvent::Ready);

    transport.emit_connection_error("socket closed");
    transport.emit_channel_error("PRECONDITION_FAILED");

    let mut kinds = Vec::new();
    for _ in 0..2 {
        match events.recv().await.unwrap() {
            ClientEvent::Error(fault) => kinds.push(fault.kind),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(kinds, vec![FaultKind::Connection, FaultKind::Channel]);
}

#[tokio::test]
async fn test_connection_fault_disconnects_and_connect_reopens() {
    let (client, transport) = queue_client(&["q1"]);
    client.subscribe("q1", noop("worker")).await.unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.consumer_tags().await.len(), 1);

    let mut states = client.state_changes();
    transport.emit_connection_error("socket closed");
    assert_ok!(
        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
    );
    settle().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.consumer_tags().await.is_empty());
    assert_eq!(
        count(&transport, |c| *c == TransportCall::CloseConnection).await,
        1
    );

    // Calls made while disconnected are buffered again.
    client.publish("q1", json!({"after": "fault"})).await.unwrap();
    assert_eq!(client.pending_publishes().await, 1);

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::Connect { .. })).await,
        2
    );
    assert_eq!(client.pending_publishes().await, 0);
}

#[tokio::test]
async fn test_channel_fault_disconnects_client() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();
    let mut events = client.events();
    let mut states = client.state_changes();

    transport.emit_channel_error("PRECONDITION_FAILED");
    assert_ok!(
        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
    );
    settle().await;

    match events.recv().await.unwrap() {
        ClientEvent::Error(fault) => assert_eq!(fault.kind, FaultKind::Channel),
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(
        count(&transport, |c| *c == TransportCall::CloseChannel).await,
        1
    );

    client.close().await.unwrap();
    assert_eq!(
        count(&transport, |c| *c == TransportCall::CloseConnection).await,
        1
    );
}

#[tokio::test]
async fn test_fault_after_close_is_ignored() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();
    client.close().await.unwrap();

    transport.emit_connection_error("late fault");
    settle().await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        count(&transport, |c| *c == TransportCall::CloseConnection).await,
        1
    );

    // Both connections' listeners fire; only the current one disconnects.
    client.connect().await.unwrap();
    let mut states = client.state_changes();
    transport.emit_connection_error("socket closed");
    assert_ok!(
        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
    );
    settle().await;
    assert_eq!(
        count(&transport, |c| *c == TransportCall::CloseConnection).await,
        2
    );
}

#[tokio::test]
async fn test_topology_failure_returns_error_and_resets() {
    let (client, transport) = event_client("svc", &["evt"], &[]);
    transport.fail_on(MockOperation::AssertExchange).await;

    let err = client.connect().await.unwrap_err();

    assert!(matches!(err, CourierError::Transport(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_close_twice_is_ok() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert_eq!(
        count(&transport, |c| *c == TransportCall::CloseChannel).await,
        1
    );
    assert_eq!(
        count(&transport, |c| *c == TransportCall::CloseConnection).await,
        1
    );
}

#[tokio::test]
async fn test_close_without_connect_is_ok() {
    let (client, transport) = queue_client(&["q1"]);
    client.close().await.unwrap();
    assert!(transport.calls().await.is_empty());
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let (client, transport) = queue_client(&["q1"]);
    client.connect().await.unwrap();
    client.close().await.unwrap();

    client.publish("q1", json!({"again": true})).await.unwrap();
    assert_eq!(client.pending_publishes().await, 1);
    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(
        count(&transport, |c| matches!(c, TransportCall::Connect { .. })).await,
        2
    );
    assert_eq!(client.pending_publishes().await, 0);
}

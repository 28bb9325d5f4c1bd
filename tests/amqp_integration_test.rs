//! AMQP adapter against the in-memory broker

mod common;

use common::*;
use queue_bridge::messaging::providers::in_memory::InMemoryAmqp;
use queue_bridge::messaging::{
    Broker, BrokerError, Handler, JsonCodec, Message, Publication, PublishConfig,
    SubscribeConfig, SubscriberState,
};
use queue_bridge::AmqpBroker;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ack_on_success() -> SubscribeConfig {
    SubscribeConfig::new().with_queue(QUEUE).ack_on_success()
}

#[tokio::test]
async fn test_orders_ack_on_success_acks_exactly_once() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = recording_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    assert_eq!(next_body(&mut rx).await, "order-1");

    wait_until(|| async { !backend.acked().is_empty() }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.acked(), vec![b"order-1".to_vec()]);
    assert!(backend.nacked().is_empty());
    assert_eq!(backend.unacked_count(), 0);

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_orders_handler_error_nacks_with_requeue() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = failing_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success().requeue_on_error())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    assert_eq!(next_body(&mut rx).await, "order-1");

    wait_until(|| async { !backend.nacked().is_empty() }).await;
    subscription.unsubscribe().await.unwrap();

    let nacks = backend.nacked();
    assert_eq!(nacks[0], (b"order-1".to_vec(), true));
    assert!(backend.acked().is_empty());

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_without_requeue_drops_message() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = failing_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    next_body(&mut rx).await;

    wait_until(|| async { !backend.nacked().is_empty() }).await;
    assert_eq!(backend.nacked(), vec![(b"order-1".to_vec(), false)]);
    assert_eq!(backend.queue_depth(QUEUE), 0);
    assert!(recv_within(&mut rx, Duration::from_millis(100)).await.is_none());

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_auto_ack_never_settles() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = failing_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, SubscribeConfig::new().with_queue(QUEUE))
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    next_body(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(backend.settlements().is_empty());
    assert_eq!(backend.unacked_count(), 0);

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_handler_can_settle_itself() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let handler: Arc<dyn Handler> = Arc::new(|publication: Publication| async move {
        publication.nack_with(true).await?;
        anyhow::Ok(())
    });
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    wait_until(|| async { !backend.nacked().is_empty() }).await;
    subscription.unsubscribe().await.unwrap();

    // The handler returned Ok, but the publication was already settled
    assert!(backend.acked().is_empty());

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_subscription_resumes_after_reconnect() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = recording_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("before"), PublishConfig::new())
        .await
        .unwrap();
    assert_eq!(next_body(&mut rx).await, "before");

    backend.set_reachable(false);
    backend.sever();
    wait_until(|| async { !broker.status().connected }).await;

    let err = broker
        .publish(TOPIC, Message::new("while-down"), PublishConfig::new())
        .await
        .unwrap_err();
    assert!(err.is_connection_error());

    backend.set_reachable(true);
    wait_until(|| async { broker.status().connected }).await;
    assert_eq!(broker.status().epoch, 2);
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("after"), PublishConfig::new())
        .await
        .unwrap();
    assert_eq!(next_body(&mut rx).await, "after");

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unacked_delivery_is_redelivered_after_connection_loss() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler: Arc<dyn Handler> = {
        let calls = Arc::clone(&calls);
        Arc::new(move |publication: Publication| {
            let calls = Arc::clone(&calls);
            let tx = tx.clone();
            async move {
                // The first attempt outlives the connection
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                }
                let _ = tx.send(publication);
                anyhow::Ok(())
            }
        })
    };
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    wait_until(|| async { calls.load(Ordering::SeqCst) == 1 }).await;
    backend.sever();

    let first = recv_within(&mut rx, WAIT).await.unwrap();
    let second = recv_within(&mut rx, WAIT).await.unwrap();
    assert_eq!(first.message().body, b"order-1");
    assert_eq!(second.message().body, b"order-1");
    wait_until(|| async { backend.acked().len() == 1 }).await;

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_while_waiting_for_connection() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    backend.set_reachable(false);
    backend.sever();
    wait_until(|| async { !broker.status().connected }).await;

    let (handler, mut rx) = recording_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    tokio::time::timeout(
        WAIT,
        subscription.wait_for_state(|state| state == SubscriberState::WaitingConnection),
    )
    .await
    .unwrap();

    subscription.unsubscribe().await.unwrap();
    tokio::time::timeout(WAIT, subscription.wait_stopped())
        .await
        .unwrap();
    assert_eq!(subscription.state(), SubscriberState::Unsubscribed);

    backend.set_reachable(true);
    wait_until(|| async { broker.status().connected }).await;
    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    assert!(recv_within(&mut rx, Duration::from_millis(200)).await.is_none());

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_consumer_setup_failures_are_retried() {
    let backend = InMemoryAmqp::new();
    backend.fail_next_consumes(3);
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = recording_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("order-1"), PublishConfig::new())
        .await
        .unwrap();
    assert_eq!(next_body(&mut rx).await, "order-1");

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_waits_for_in_flight_handler() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let started = Arc::new(tokio::sync::Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    let handler: Arc<dyn Handler> = {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        Arc::new(move |_publication: Publication| {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
    };
    let subscription = broker
        .subscribe(TOPIC, handler, SubscribeConfig::new().with_queue(QUEUE))
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    broker
        .publish(TOPIC, Message::new("slow"), PublishConfig::new())
        .await
        .unwrap();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    assert_eq!(broker.in_flight(), 1);

    broker.disconnect().await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.in_flight(), 0);

    tokio::time::timeout(WAIT, subscription.wait_stopped())
        .await
        .unwrap();
    assert_eq!(subscription.state(), SubscriberState::Unsubscribed);
}

#[tokio::test]
async fn test_calls_before_connect_and_after_disconnect() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);

    let err = broker
        .publish(TOPIC, Message::new("early"), PublishConfig::new())
        .await
        .unwrap_err();
    assert!(err.is_connection_error());

    let (handler, _rx) = recording_handler();
    let err = broker
        .subscribe(TOPIC, Arc::clone(&handler), ack_on_success())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotConnected { .. }));

    broker.connect().await.unwrap();
    broker.connect().await.unwrap();
    assert_eq!(backend.dial_count(), 1);

    broker.init(amqp_options()).await.unwrap_err();
    broker.disconnect().await.unwrap();

    assert!(matches!(broker.connect().await, Err(BrokerError::Shutdown)));
    assert!(matches!(
        broker.subscribe(TOPIC, handler, ack_on_success()).await,
        Err(BrokerError::Shutdown)
    ));
}

#[tokio::test]
async fn test_connect_failure_is_surfaced() {
    let backend = InMemoryAmqp::new();
    backend.set_reachable(false);
    let broker = AmqpBroker::new(
        Arc::new(backend.clone()),
        amqp_options().with_addresses(["amqp://a:5672", "amqp://b:5672"]),
    );

    let err = broker.connect().await.unwrap_err();
    assert!(err.is_connection_error());
    // One attempt per configured address
    assert_eq!(backend.dial_count(), 2);
    assert!(!broker.status().connected);
}

#[tokio::test]
async fn test_decode_error_reaches_handler_with_raw_body() {
    let backend = InMemoryAmqp::new();
    let broker = AmqpBroker::new(
        Arc::new(backend.clone()),
        amqp_options().with_codec(Arc::new(JsonCodec)),
    );
    broker.connect().await.unwrap();

    let (handler, mut rx) = recording_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    backend.inject("queue-bridge", TOPIC, "not json");
    let publication = recv_within(&mut rx, WAIT).await.unwrap();
    assert!(matches!(
        publication.error(),
        Some(BrokerError::DeliveryDecode { .. })
    ));
    assert_eq!(publication.message().body, b"not json");

    broker
        .publish(TOPIC, Message::new(r#"{ "id": 1 }"#), PublishConfig::new())
        .await
        .unwrap();
    let publication = recv_within(&mut rx, WAIT).await.unwrap();
    assert!(publication.error().is_none());
    assert_eq!(publication.message().body_str(), Some(r#"{"id":1}"#));

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_maps_properties_and_headers() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    broker
        .publish(
            TOPIC,
            Message::new("order-1").with_header("tenant", "acme"),
            PublishConfig::new()
                .persistent()
                .with_correlation_id("corr-7")
                .with_header("trace", "t-1"),
        )
        .await
        .unwrap();

    let published = backend.published();
    let (exchange, routing_key, publishing) = &published[0];
    assert_eq!(exchange, "queue-bridge");
    assert_eq!(routing_key, TOPIC);
    assert_eq!(publishing.delivery_mode, Some(2));
    assert_eq!(publishing.correlation_id.as_deref(), Some("corr-7"));
    assert_eq!(publishing.headers["tenant"], "acme");
    assert_eq!(publishing.headers["trace"], "t-1");

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unnamed_queue_and_durable_flag() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = recording_handler();
    let durable = broker
        .subscribe(
            TOPIC,
            Arc::clone(&handler),
            ack_on_success().durable_queue(),
        )
        .await
        .unwrap();
    let unnamed = broker
        .subscribe(TOPIC, handler, SubscribeConfig::new())
        .await
        .unwrap();
    wait_for_consuming(&durable).await;
    wait_for_consuming(&unnamed).await;
    assert!(backend.is_durable(QUEUE));

    broker
        .publish(TOPIC, Message::new("fan-out"), PublishConfig::new())
        .await
        .unwrap();
    // Both queues are bound to the topic, so each gets a copy
    assert_eq!(next_body(&mut rx).await, "fan-out");
    assert_eq!(next_body(&mut rx).await, "fan-out");

    broker.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_recovers_after_channel_close() {
    let backend = InMemoryAmqp::new();
    let broker = amqp_broker(&backend);
    broker.connect().await.unwrap();

    let (handler, mut rx) = recording_handler();
    let subscription = broker
        .subscribe(TOPIC, handler, ack_on_success())
        .await
        .unwrap();
    wait_for_consuming(&subscription).await;

    backend.close_publisher_channels();
    let err = broker
        .publish(TOPIC, Message::new("rejected"), PublishConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Publish { .. }));

    // Same connection, fresh channel
    broker
        .publish(TOPIC, Message::new("order-2"), PublishConfig::new())
        .await
        .unwrap();
    assert_eq!(next_body(&mut rx).await, "order-2");
    assert_eq!(broker.status().epoch, 1);
    assert_eq!(backend.dial_count(), 1);

    broker.disconnect().await.unwrap();
}

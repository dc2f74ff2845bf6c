use super::*;
use std::time::Duration;

fn earliest(durable: &str) -> SubscriptionOptions {
    SubscriptionOptions::durable(durable, StartPosition::Earliest)
}

fn now(durable: &str) -> SubscriptionOptions {
    SubscriptionOptions::durable(durable, StartPosition::Now)
}

async fn publish_all(broker: &ChannelBroker, topic: &str, payloads: &[&'static [u8]]) {
    for payload in payloads {
        broker
            .publish(topic, Bytes::from_static(payload))
            .await
            .unwrap();
    }
}

async fn next_payload(sub: &mut Box<dyn Subscription>) -> Bytes {
    tokio::time::timeout(Duration::from_millis(200), sub.next())
        .await
        .expect("timed out waiting for delivery")
        .unwrap()
        .expect("subscription ended")
        .payload
}

#[tokio::test]
async fn test_channel_publish_without_subscribers() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"m1", b"m2"]).await;
    assert_eq!(broker.message_count("orders"), 2);
    assert_eq!(broker.message_count("inventory"), 0);
}

#[tokio::test]
async fn test_channel_earliest_delivers_backlog_in_order() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"m1", b"m2", b"m3"]).await;

    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
    let expected: [&'static [u8]; 3] = [b"m1", b"m2", b"m3"];
    for payload in expected {
        assert_eq!(next_payload(&mut sub).await, Bytes::from_static(payload));
        sub.ack().await.unwrap();
    }
    assert_eq!(broker.cursor_position("orders", "reader"), Some(3));
}

#[tokio::test]
async fn test_channel_now_skips_backlog() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"old"]).await;

    let mut sub = broker.subscribe("orders", now("reader")).await.unwrap();
    let idle = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
    assert!(idle.is_err(), "backlog must not be delivered");

    publish_all(&broker, "orders", &[b"new"]).await;
    assert_eq!(next_payload(&mut sub).await, Bytes::from_static(b"new"));
}

#[tokio::test]
async fn test_channel_single_in_flight_redelivers_until_ack() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"m1", b"m2"]).await;

    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
    let first = sub.next().await.unwrap().unwrap();
    assert!(!first.redelivered);

    let again = sub.next().await.unwrap().unwrap();
    assert_eq!(again.sequence, first.sequence);
    assert!(again.redelivered);

    sub.ack().await.unwrap();
    let second = sub.next().await.unwrap().unwrap();
    assert_eq!(second.payload, Bytes::from_static(b"m2"));
}

#[tokio::test]
async fn test_channel_ack_without_delivery_fails() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
    assert!(matches!(sub.ack().await, Err(BusError::Ack(_))));
}

#[tokio::test]
async fn test_channel_close_preserves_cursor() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"m1", b"m2"]).await;

    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
    next_payload(&mut sub).await;
    sub.ack().await.unwrap();
    sub.close().await.unwrap();
    assert!(!broker.is_active("orders", "reader"));

    // Start position is ignored for an existing cursor.
    let mut resumed = broker.subscribe("orders", now("reader")).await.unwrap();
    assert_eq!(next_payload(&mut resumed).await, Bytes::from_static(b"m2"));
}

#[tokio::test]
async fn test_channel_unsubscribe_discards_cursor() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"m1", b"m2"]).await;

    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
    next_payload(&mut sub).await;
    sub.ack().await.unwrap();
    sub.unsubscribe().await.unwrap();
    assert_eq!(broker.cursor_position("orders", "reader"), None);

    let mut fresh = broker.subscribe("orders", earliest("reader")).await.unwrap();
    assert_eq!(next_payload(&mut fresh).await, Bytes::from_static(b"m1"));
}

#[tokio::test]
async fn test_channel_unacked_delivery_redelivered_after_close() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"m1"]).await;

    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
    next_payload(&mut sub).await;
    sub.close().await.unwrap();

    let mut resumed = broker.subscribe("orders", earliest("reader")).await.unwrap();
    let delivery = resumed.next().await.unwrap().unwrap();
    assert_eq!(delivery.payload, Bytes::from_static(b"m1"));
    assert!(delivery.redelivered);
}

#[tokio::test]
async fn test_channel_rejects_concurrent_durable() {
    let broker = ChannelBroker::new();
    let _held = broker.subscribe("orders", earliest("reader")).await.unwrap();

    let second = broker.subscribe("orders", earliest("reader")).await;
    assert!(matches!(second, Err(BusError::Subscribe(_))));

    // Different durable name or topic is independent.
    assert!(broker.subscribe("orders", earliest("other")).await.is_ok());
    assert!(broker.subscribe("inventory", earliest("reader")).await.is_ok());
}

#[tokio::test]
async fn test_channel_drop_releases_durable() {
    let broker = ChannelBroker::new();
    {
        let _sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
        assert!(broker.is_active("orders", "reader"));
    }
    assert!(!broker.is_active("orders", "reader"));
    assert_eq!(broker.cursor_position("orders", "reader"), Some(0));
}

#[tokio::test]
async fn test_channel_waiting_subscription_wakes_on_publish() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher
            .publish("orders", Bytes::from_static(b"late"))
            .await
            .unwrap();
    });

    assert_eq!(next_payload(&mut sub).await, Bytes::from_static(b"late"));
}

#[tokio::test]
async fn test_channel_sever_fails_subscription_and_publish() {
    let broker = ChannelBroker::new();
    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();

    let severing = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        severing.sever();
    });

    let result = tokio::time::timeout(Duration::from_millis(200), sub.next())
        .await
        .unwrap();
    assert!(matches!(result, Err(BusError::ConnectionLost)));

    let publish = broker.publish("orders", Bytes::from_static(b"m1")).await;
    assert!(matches!(publish, Err(BusError::BrokerUnavailable(_))));

    tokio::time::timeout(Duration::from_millis(50), broker.connection_lost())
        .await
        .expect("connection_lost should resolve after sever");
}

#[tokio::test]
async fn test_channel_reconnect_shares_cursors() {
    let broker = ChannelBroker::new();
    publish_all(&broker, "orders", &[b"m1", b"m2"]).await;

    let mut sub = broker.subscribe("orders", earliest("reader")).await.unwrap();
    next_payload(&mut sub).await;
    sub.ack().await.unwrap();
    broker.sever();
    drop(sub);

    let restarted = broker.reconnect();
    let mut resumed = restarted
        .subscribe("orders", earliest("reader"))
        .await
        .unwrap();
    assert_eq!(next_payload(&mut resumed).await, Bytes::from_static(b"m2"));
}

#[tokio::test]
async fn test_channel_connection_lost_pending_while_healthy() {
    let broker = ChannelBroker::new();
    let result = tokio::time::timeout(Duration::from_millis(30), broker.connection_lost()).await;
    assert!(result.is_err());
}

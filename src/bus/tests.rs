use super::*;

#[test]
fn test_messaging_config_default() {
    let config = MessagingConfig::default();
    assert_eq!(config.messaging_type, MessagingType::Channel);
    assert_eq!(config.nats.url, "nats://localhost:4222");
    assert_eq!(config.nats.client_id, "tailgate");
}

#[test]
fn test_messaging_type_deserializes_lowercase() {
    let nats: MessagingType = serde_json::from_str("\"nats\"").unwrap();
    let channel: MessagingType = serde_json::from_str("\"channel\"").unwrap();
    assert_eq!(nats, MessagingType::Nats);
    assert_eq!(channel, MessagingType::Channel);
}

#[test]
fn test_teardown_deserializes_lowercase() {
    let close: Teardown = serde_json::from_str("\"close\"").unwrap();
    let unsubscribe: Teardown = serde_json::from_str("\"unsubscribe\"").unwrap();
    assert_eq!(close, Teardown::Close);
    assert_eq!(unsubscribe, Teardown::Unsubscribe);
    assert_eq!(Teardown::default(), Teardown::Close);
}

#[test]
fn test_subscription_options_durable() {
    let options = SubscriptionOptions::durable("reader", StartPosition::Earliest);
    assert_eq!(options.durable_name, "reader");
    assert_eq!(options.start, StartPosition::Earliest);
}

#[cfg(feature = "channel")]
#[tokio::test]
async fn test_connect_channel_broker() {
    let broker = connect(&MessagingConfig::default()).await.unwrap();
    broker
        .publish("orders", Bytes::from_static(b"m1"))
        .await
        .unwrap();

    let mut sub = broker
        .subscribe(
            "orders",
            SubscriptionOptions::durable("reader", StartPosition::Earliest),
        )
        .await
        .unwrap();
    let delivery = sub.next().await.unwrap().unwrap();
    assert_eq!(delivery.payload, Bytes::from_static(b"m1"));
}

#[cfg(not(feature = "nats"))]
#[tokio::test]
async fn test_connect_nats_without_feature_fails() {
    let config = MessagingConfig {
        messaging_type: MessagingType::Nats,
        ..Default::default()
    };
    let result = connect(&config).await;
    assert!(matches!(result, Err(BusError::Connect(_))));
}

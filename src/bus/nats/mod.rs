//! NATS JetStream broker implementation.
//!
//! Each topic maps to a JetStream stream with a single subject:
//! - Stream: `{PREFIX}_{TOPIC}` (upper-cased, subject tokens joined by `_`)
//! - Subject: `{prefix}.{topic}`
//!
//! Durable cursors are durable pull consumers named `{client_id}_{durable}`
//! with explicit acks and `max_ack_pending = 1`, which gives single-in-flight
//! delivery. A consumer that already exists keeps its position: the
//! requested start position only applies when the consumer is created.
//!
//! - close: drop the pull stream, keep the consumer
//! - unsubscribe: delete the consumer
//!
//! Known limitation: a pull request still open on the server when a stream is
//! dropped can capture the next message. That message is redelivered after
//! `ack_wait`. Pull requests are kept short (`PULL_EXPIRY`) to narrow the gap.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    Context,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::{
    Broker, BusError, Delivery, NatsBrokerConfig, Result, StartPosition, Subscription,
    SubscriptionOptions,
};

/// Lifetime of a single pull request.
const PULL_EXPIRY: Duration = Duration::from_secs(2);

/// Idle heartbeat for pull requests.
const PULL_HEARTBEAT: Duration = Duration::from_millis(500);

/// Default ack wait before the server redelivers an unacknowledged message.
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Configuration for NATS connection.
#[derive(Clone, Debug)]
pub struct NatsConfig {
    /// NATS server URL (e.g., nats://localhost:4222).
    pub url: String,
    /// Prefix for stream names and subjects.
    pub stream_prefix: String,
    /// Client identity; durable consumer names are scoped to it.
    pub client_id: String,
    /// How long the server waits for an ack before redelivering.
    pub ack_wait: Duration,
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_prefix: "tailgate".to_string(),
            client_id: "tailgate".to_string(),
            ack_wait: DEFAULT_ACK_WAIT,
        }
    }

    /// Set stream prefix.
    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    /// Set client identity.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set ack wait.
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Build the stream name for a topic.
    pub fn stream_name(&self, topic: &str) -> String {
        sanitize(&format!("{}_{}", self.stream_prefix, topic)).to_uppercase()
    }

    /// Build the subject for a topic.
    pub fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.stream_prefix, topic)
    }

    /// Build the consumer name for a durable cursor.
    pub fn consumer_name(&self, durable_name: &str) -> String {
        sanitize(&format!("{}_{}", self.client_id, durable_name))
    }
}

impl From<&NatsBrokerConfig> for NatsConfig {
    fn from(config: &NatsBrokerConfig) -> Self {
        NatsConfig::new(&config.url)
            .with_stream_prefix(&config.stream_prefix)
            .with_client_id(&config.client_id)
    }
}

/// Replace characters JetStream rejects in stream and consumer names.
fn sanitize(name: &str) -> String {
    name.replace(
        |c: char| matches!(c, '.' | '*' | '>' | '/' | '\\') || c.is_whitespace(),
        "_",
    )
}

/// NATS JetStream broker.
pub struct NatsBroker {
    jetstream: Context,
    config: NatsConfig,
    streams: RwLock<HashSet<String>>,
    lost: Arc<watch::Sender<bool>>,
}

impl NatsBroker {
    /// Connect to NATS and register the connection-lost hook.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let (lost, _) = watch::channel(false);
        let lost = Arc::new(lost);
        let notify = Arc::clone(&lost);

        let client = async_nats::ConnectOptions::new()
            .name(&config.client_id)
            .event_callback(move |event| {
                let notify = Arc::clone(&notify);
                async move {
                    match event {
                        async_nats::Event::Disconnected => {
                            warn!("NATS connection lost");
                            notify.send_replace(true);
                        }
                        other => debug!(event = %other, "NATS connection event"),
                    }
                }
            })
            .connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Connect(format!("Failed to connect to NATS: {}", e)))?;

        info!(
            url = %config.url,
            stream_prefix = %config.stream_prefix,
            client_id = %config.client_id,
            "Connected to NATS"
        );

        Ok(Self {
            jetstream: jetstream::new(client),
            config,
            streams: RwLock::new(HashSet::new()),
            lost,
        })
    }

    /// Ensure the stream backing a topic exists.
    async fn ensure_stream(
        &self,
        topic: &str,
    ) -> std::result::Result<jetstream::stream::Stream, String> {
        let name = self.config.stream_name(topic);
        let stream = self
            .jetstream
            .get_or_create_stream(StreamConfig {
                name: name.clone(),
                subjects: vec![self.config.subject(topic)],
                retention: RetentionPolicy::Limits,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| format!("Failed to create stream '{}': {}", name, e))?;

        self.streams.write().await.insert(topic.to_string());
        Ok(stream)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.streams.read().await.contains(topic) {
            self.ensure_stream(topic)
                .await
                .map_err(BusError::BrokerUnavailable)?;
        }

        let subject = self.config.subject(topic);
        let ack = self
            .jetstream
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| BusError::BrokerUnavailable(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BusError::BrokerUnavailable(format!("Publish not acknowledged: {}", e)))?;

        debug!(subject = %subject, sequence = ack.sequence, "Published message to JetStream");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>> {
        let stream = self
            .ensure_stream(topic)
            .await
            .map_err(BusError::Subscribe)?;

        let consumer_name = self.config.consumer_name(&options.durable_name);
        let deliver_policy = match options.start {
            StartPosition::Earliest => DeliverPolicy::All,
            StartPosition::Now => DeliverPolicy::New,
        };

        let consumer: jetstream::consumer::Consumer<pull::Config> = stream
            .get_or_create_consumer(
                &consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    deliver_policy,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_ack_pending: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BusError::Subscribe(format!(
                    "Failed to open consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        let messages = consumer
            .stream()
            .max_messages_per_batch(1)
            .expires(PULL_EXPIRY)
            .heartbeat(PULL_HEARTBEAT)
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to get message stream: {}", e)))?;

        info!(
            topic = %topic,
            consumer = %consumer_name,
            start = ?options.start,
            "Opened JetStream durable consumer"
        );

        Ok(Box::new(NatsSubscription {
            stream,
            consumer_name,
            messages,
            in_flight: None,
        }))
    }

    async fn connection_lost(&self) {
        let mut lost = self.lost.subscribe();
        if lost.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Durable pull subscription on a JetStream stream.
struct NatsSubscription {
    stream: jetstream::stream::Stream,
    consumer_name: String,
    messages: pull::Stream,
    in_flight: Option<jetstream::Message>,
}

fn to_delivery(message: &jetstream::Message, held: bool) -> Delivery {
    let (sequence, delivered) = message
        .info()
        .map(|info| (info.stream_sequence, info.delivered))
        .unwrap_or((0, 1));

    Delivery {
        payload: message.payload.clone(),
        sequence,
        redelivered: held || delivered > 1,
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        if let Some(message) = &self.in_flight {
            return Ok(Some(to_delivery(message, true)));
        }

        match self.messages.next().await {
            Some(Ok(message)) => {
                let delivery = to_delivery(&message, false);
                self.in_flight = Some(message);
                Ok(Some(delivery))
            }
            Some(Err(e)) => Err(BusError::Subscribe(format!(
                "Failed to receive message: {}",
                e
            ))),
            None => Ok(None),
        }
    }

    async fn ack(&mut self) -> Result<()> {
        let message = self
            .in_flight
            .take()
            .ok_or_else(|| BusError::Ack("no outstanding delivery".to_string()))?;

        // Wait for the server so the cursor has moved before any reopen.
        message
            .double_ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!(consumer = %self.consumer_name, "Closing JetStream subscription");
        Ok(())
    }

    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        let NatsSubscription {
            stream,
            consumer_name,
            messages,
            ..
        } = *self;
        drop(messages);

        stream.delete_consumer(&consumer_name).await.map_err(|e| {
            BusError::Subscribe(format!(
                "Failed to delete consumer '{}': {}",
                consumer_name, e
            ))
        })?;

        debug!(consumer = %consumer_name, "Deleted JetStream durable consumer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_is_sanitized() {
        let config = NatsConfig::new("nats://localhost:4222");
        assert_eq!(config.stream_name("orders"), "TAILGATE_ORDERS");
        assert_eq!(config.stream_name("k8s.pods"), "TAILGATE_K8S_PODS");
    }

    #[test]
    fn test_subject_keeps_topic_tokens() {
        let config = NatsConfig::new("nats://localhost:4222").with_stream_prefix("acme");
        assert_eq!(config.subject("k8s.pods"), "acme.k8s.pods");
    }

    #[test]
    fn test_consumer_name_scoped_to_client() {
        let config = NatsConfig::new("nats://localhost:4222").with_client_id("ingest-1");
        assert_eq!(config.consumer_name("reader"), "ingest-1_reader");
        assert_eq!(config.consumer_name("a.b c"), "ingest-1_a_b_c");
    }

    #[test]
    fn test_from_broker_config() {
        let config = NatsConfig::from(&NatsBrokerConfig::default());
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.stream_prefix, "tailgate");
        assert_eq!(config.ack_wait, DEFAULT_ACK_WAIT);
    }
}

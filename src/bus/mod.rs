//! Message broker abstraction.
//!
//! This module contains:
//! - `Broker` trait: durable publish / subscribe over named topics
//! - `Subscription` trait: single-in-flight delivery against a durable cursor
//! - Broker configuration types and the `connect` factory
//! - Implementations: Channel (in-process), NATS JetStream, Mock

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

// Implementation modules
#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
#[cfg(feature = "channel")]
pub use channel::ChannelBroker;
pub use mock::MockBroker;
#[cfg(feature = "nats")]
pub use nats::{NatsBroker, NatsConfig};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
///
/// None of these are retried inside the crate. Retry and restart policy
/// belongs to the caller or the process supervisor.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Broker connection lost")]
    ConnectionLost,

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    #[error("Subscribe not supported for this broker type")]
    SubscribeNotSupported,
}

// ============================================================================
// Subscription options
// ============================================================================

/// Where a newly created durable cursor starts.
///
/// Only applies when the broker has no cursor under the durable name yet.
/// An existing cursor always resumes from its stored position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver from the earliest retained message.
    Earliest,
    /// Deliver only messages published after the subscription opens.
    Now,
}

/// How a subscription is released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Teardown {
    /// Release local resources, keep the durable cursor.
    #[default]
    Close,
    /// Release local resources and discard the durable cursor.
    Unsubscribe,
}

/// Options for opening a durable subscription.
///
/// Every subscription is single-in-flight: the broker withholds the next
/// message until the current one is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Durable cursor name.
    pub durable_name: String,
    /// Start position for a new cursor.
    pub start: StartPosition,
}

impl SubscriptionOptions {
    pub fn durable(durable_name: impl Into<String>, start: StartPosition) -> Self {
        Self {
            durable_name: durable_name.into(),
            start,
        }
    }
}

/// One message handed out by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Raw message bytes as published.
    pub payload: Bytes,
    /// Broker-assigned position of the message in the topic.
    pub sequence: u64,
    /// True when the broker has handed this message out before.
    pub redelivered: bool,
}

// ============================================================================
// Traits
// ============================================================================

/// Connection handle to a broker with durable named subscriptions.
///
/// Implementations:
/// - `ChannelBroker`: in-process durable log
/// - `NatsBroker`: NATS JetStream
/// - `MockBroker`: failure injection for tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably append a message to a topic.
    ///
    /// Fails with `BrokerUnavailable` if the broker rejects the publish.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Open a durable, single-in-flight subscription.
    async fn subscribe(
        &self,
        topic: &str,
        options: SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>>;

    /// Resolves once the broker connection is lost.
    ///
    /// Never resolves while the connection is healthy.
    async fn connection_lost(&self);
}

/// A live durable subscription.
///
/// At most one delivery is outstanding at a time. `next` must be
/// cancel-safe: dropping its future must not lose a message.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message.
    ///
    /// Returns `None` if the broker ended the subscription. Calling `next`
    /// again without acknowledging hands out the same message again.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Acknowledge the outstanding delivery, advancing the durable cursor.
    async fn ack(&mut self) -> Result<()>;

    /// Release the subscription, keeping the durable cursor.
    async fn close(self: Box<Self>) -> Result<()>;

    /// Release the subscription and discard the durable cursor.
    async fn unsubscribe(self: Box<Self>) -> Result<()>;
}

/// Release a subscription with the given teardown mode.
pub async fn teardown(subscription: Box<dyn Subscription>, mode: Teardown) -> Result<()> {
    match mode {
        Teardown::Close => subscription.close().await,
        Teardown::Unsubscribe => subscription.unsubscribe().await,
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker (no external dependencies).
    #[default]
    Channel,
    /// NATS JetStream.
    Nats,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// NATS-specific configuration.
    pub nats: NatsBrokerConfig,
}

/// NATS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsBrokerConfig {
    /// NATS server URL.
    pub url: String,
    /// Prefix for stream names and subjects.
    pub stream_prefix: String,
    /// Client identity. Durable cursors are scoped to it.
    pub client_id: String,
}

impl Default for NatsBrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_prefix: "tailgate".to_string(),
            client_id: "tailgate".to_string(),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Connect to the broker selected by configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (included in default)
/// - NATS: `--features nats`
///
/// Connection failure is returned as `BusError::Connect`; it is not retried.
pub async fn connect(config: &MessagingConfig) -> Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                info!(messaging_type = "channel", "Broker initialized");
                Ok(Arc::new(ChannelBroker::new()))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err(BusError::Connect(
                    "Channel support requires the 'channel' feature. Rebuild with --features channel"
                        .to_string(),
                ))
            }
        }
        MessagingType::Nats => {
            #[cfg(feature = "nats")]
            {
                let nats_config = NatsConfig::from(&config.nats);
                let broker = NatsBroker::connect(nats_config).await?;
                info!(messaging_type = "nats", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err(BusError::Connect(
                    "NATS support requires the 'nats' feature. Rebuild with --features nats"
                        .to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests;

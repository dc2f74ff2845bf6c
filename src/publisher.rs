//! Publisher: envelope → topic.
//!
//! Serializes an envelope to its JSON wire form and appends it to a topic.
//! Failures are returned to the caller as-is; retry or drop is the caller's
//! decision.

use std::sync::Arc;

use tracing::debug;

use crate::bus::{Broker, Result};
use crate::envelope::Envelope;

/// Writes envelopes to topics over an injected broker connection.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Serialize and durably publish an envelope.
    ///
    /// Errors:
    /// - `Serialization` if the envelope cannot be encoded
    /// - `BrokerUnavailable` if the broker rejects the publish
    #[tracing::instrument(name = "publisher.write", skip_all, fields(topic = %topic, kind = %envelope.kind))]
    pub async fn write(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let payload = envelope.to_bytes()?;
        let size = payload.len();

        self.broker.publish(topic, payload).await?;

        debug!(topic = %topic, bytes = size, "Published envelope");
        Ok(())
    }
}

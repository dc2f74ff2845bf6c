//! tailgate-publish: envelope publisher
//!
//! Reads newline-delimited JSON envelopes from stdin and publishes each one
//! to the configured topic. Envelopes with `when == 0` are stamped with the
//! current time.
//!
//! ## Configuration
//! - TAILGATE_CONFIG: Path to YAML config (optional)
//! - TAILGATE__TOPIC: Topic to publish to (default: events)
//! - TAILGATE__MESSAGING__TYPE: channel | nats
//! - TAILGATE_LOG: Log filter (default: info)
//!
//! Stops at the first invalid line or rejected publish; nothing is retried.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use tailgate::bus;
use tailgate::envelope::Envelope;
use tailgate::publisher::Publisher;
use tailgate::utils::bootstrap::bootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = bootstrap("publish")?;

    let broker = bus::connect(&config.messaging).await.map_err(|e| {
        error!(error = %e, "Failed to connect to broker");
        e
    })?;
    let publisher = Publisher::new(broker);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut envelope = Envelope::from_slice(line.as_bytes()).map_err(|e| {
            error!(index = published + 1, error = %e, "Invalid envelope");
            e
        })?;
        if envelope.when == 0 {
            envelope.when = chrono::Utc::now().timestamp();
        }

        publisher.write(&config.topic, &envelope).await.map_err(|e| {
            error!(error = %e, "Publish failed");
            e
        })?;
        published += 1;
    }

    info!(topic = %config.topic, published, "tailgate-publish finished");
    Ok(())
}

//! tailgate-tail: catch-up-then-tail consumer process
//!
//! Replays the configured topic from the durable cursor, then logs live
//! envelopes until interrupted.
//!
//! ## Architecture
//! ```text
//! [broker] --(durable cursor)--> [CatchUpTailer] --> [EnvelopeLogSink] --> log
//! ```
//!
//! ## Configuration
//! - TAILGATE_CONFIG: Path to YAML config (optional)
//! - TAILGATE__TOPIC: Topic to tail (default: events)
//! - TAILGATE__MESSAGING__TYPE: channel | nats
//! - TAILGATE_LOG: Log filter (default: info)
//!
//! ## Exit behaviour
//! Ctrl+C ends the run cleanly (exit 0). Connection loss or a subscription
//! failure exits non-zero; restarting is left to the process supervisor,
//! which resumes from the durable cursor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tailgate::bus;
use tailgate::tailer::{CatchUpTailer, EnvelopeLogSink};
use tailgate::utils::bootstrap::{bootstrap, cancel_on_ctrl_c};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = bootstrap("tail")?;

    let broker = bus::connect(&config.messaging).await.map_err(|e| {
        error!(error = %e, "Failed to connect to broker");
        e
    })?;

    let tailer = CatchUpTailer::new(Arc::clone(&broker), config.tailer.clone());
    let cancel = cancel_on_ctrl_c(CancellationToken::new());

    info!(
        topic = %config.topic,
        durable = %config.tailer.durable_name,
        "tailgate-tail started, press Ctrl+C to exit"
    );

    let summary = tailer
        .run(&config.topic, &EnvelopeLogSink::new(), cancel)
        .await
        .map_err(|e| {
            error!(error = %e, "Tailer failed");
            e
        })?;

    info!(
        backlog = summary.backlog,
        live = summary.live,
        "tailgate-tail stopped"
    );
    Ok(())
}

//! Bootstrap utilities for tailgate binaries.
//!
//! Shared initialization code for the tail and publish binaries.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LOG_ENV_VAR};

/// Initialize tracing with TAILGATE_LOG environment variable.
///
/// Defaults to "info" level if TAILGATE_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize tracing and load configuration.
///
/// Common to all tailgate binaries.
pub fn bootstrap(binary: &str) -> Result<Config, Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(topic = %config.topic, "Starting tailgate-{}", binary);
    Ok(config)
}

/// Cancel `token` on the first Ctrl+C.
///
/// The returned token is the one passed in, for chaining.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> CancellationToken {
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                trigger.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt signal"),
        }
    });
    token
}

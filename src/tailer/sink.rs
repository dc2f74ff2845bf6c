//! Message sinks: where delivered messages go.

use std::future::Future;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::envelope::Envelope;

/// Receives each delivered message exactly once per delivery.
///
/// Handling is infallible from the tailer's point of view: completion of the
/// returned future means "ready for the next message". Sinks deal with their
/// own failures.
pub trait MessageSink: Send + Sync {
    fn handle(&self, payload: Bytes) -> BoxFuture<'static, ()>;
}

impl<F, Fut> MessageSink for F
where
    F: Fn(Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, payload: Bytes) -> BoxFuture<'static, ()> {
        Box::pin(self(payload))
    }
}

/// Sink that decodes envelopes and logs them.
///
/// Undecodable payloads are logged and skipped.
#[derive(Debug, Default, Clone)]
pub struct EnvelopeLogSink;

impl EnvelopeLogSink {
    pub fn new() -> Self {
        Self
    }
}

impl MessageSink for EnvelopeLogSink {
    fn handle(&self, payload: Bytes) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match Envelope::from_slice(&payload) {
                Ok(envelope) => info!(
                    kind = %envelope.kind,
                    when = envelope.when,
                    tenant_id = %envelope.metadata.tenant_id,
                    application_id = %envelope.metadata.application_id,
                    environment = %envelope.metadata.environment,
                    data = %envelope.data,
                    "Envelope received"
                ),
                Err(e) => warn!(error = %e, bytes = payload.len(), "Skipping undecodable message"),
            }
        })
    }
}

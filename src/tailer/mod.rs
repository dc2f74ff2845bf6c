//! Catch-up-then-tail consumer.
//!
//! `CatchUpTailer::run` replays a topic's backlog through a durable cursor,
//! decides it has caught up when no message arrives within an idle window,
//! then reopens the same durable cursor for live delivery until cancelled.
//!
//! ```text
//! Idle ──► Draining ──(idle timer)──► Switching ──► Tailing ──(cancel)──► Cancelled
//!              │                          │            │
//!              └──────── error ───────────┴────────────┴──► Closed
//! ```
//!
//! ## End-of-backlog detection
//!
//! Catch-up ends on wall-clock quiescence, not by comparing the delivered
//! sequence to the broker's head. The first message gets `grace_period`,
//! later ones `quiescence`; the timer is paused while the sink runs. A slow
//! broker can end catch-up early and a steady trickle of new messages can
//! extend it. Either way the same durable cursor carries over into the live
//! phase, so the misjudgement only affects which phase delivers a message.
//!
//! ## Cursor handling
//!
//! - catch-up teardown: `catch_up_teardown` (default close, cursor kept)
//! - live teardown on cancellation: `cancel_teardown` (default unsubscribe,
//!   cursor discarded)
//! - errors and crashes never discard the cursor

pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{
    self, Broker, BusError, Delivery, Result, StartPosition, Subscription, SubscriptionOptions,
    Teardown,
};

pub use sink::{EnvelopeLogSink, MessageSink};

/// Default durable cursor name.
pub const DEFAULT_DURABLE_NAME: &str = "reader";
/// Default wait for the first backlog message.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 500;
/// Default wait between backlog messages.
pub const DEFAULT_QUIESCENCE_MS: u64 = 200;

/// Tailer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TailerConfig {
    /// Durable cursor name shared by the catch-up and live subscriptions.
    pub durable_name: String,
    /// Idle window before the first backlog message (milliseconds).
    pub grace_period_ms: u64,
    /// Idle window after each backlog message (milliseconds).
    pub quiescence_ms: u64,
    /// How the catch-up subscription is released before tailing.
    pub catch_up_teardown: Teardown,
    /// How the subscription is released on cancellation.
    pub cancel_teardown: Teardown,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            durable_name: DEFAULT_DURABLE_NAME.to_string(),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            quiescence_ms: DEFAULT_QUIESCENCE_MS,
            catch_up_teardown: Teardown::Close,
            cancel_teardown: Teardown::Unsubscribe,
        }
    }
}

impl TailerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    /// Set durable cursor name.
    pub fn with_durable_name(mut self, durable_name: impl Into<String>) -> Self {
        self.durable_name = durable_name.into();
        self
    }

    /// Set idle windows.
    pub fn with_idle_windows(mut self, grace_period: Duration, quiescence: Duration) -> Self {
        self.grace_period_ms = grace_period.as_millis() as u64;
        self.quiescence_ms = quiescence.as_millis() as u64;
        self
    }

    /// Set teardown mode used on cancellation.
    pub fn with_cancel_teardown(mut self, teardown: Teardown) -> Self {
        self.cancel_teardown = teardown;
        self
    }

    /// Set teardown mode used between catch-up and tailing.
    pub fn with_catch_up_teardown(mut self, teardown: Teardown) -> Self {
        self.catch_up_teardown = teardown;
        self
    }
}

/// Tailer lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Replaying backlog.
    Draining,
    /// Releasing the catch-up subscription.
    Switching,
    /// Delivering live messages.
    Tailing,
    /// Stopped by cancellation.
    Cancelled,
    /// Stopped by an error.
    Closed,
}

/// Counts reported when a run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Messages delivered while draining.
    pub backlog: u64,
    /// Messages delivered while tailing.
    pub live: u64,
}

/// Durable catch-up-then-tail consumer.
pub struct CatchUpTailer {
    broker: Arc<dyn Broker>,
    config: TailerConfig,
    phase: watch::Sender<Phase>,
}

impl CatchUpTailer {
    pub fn new(broker: Arc<dyn Broker>, config: TailerConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            broker,
            config,
            phase,
        }
    }

    pub fn config(&self) -> &TailerConfig {
        &self.config
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Replay the backlog of `topic`, then deliver live messages until
    /// `cancel` fires.
    ///
    /// Each message reaches `sink` once per delivery, in broker order, and
    /// is acknowledged only after the sink returns. Cancellation is observed
    /// between messages and at the catch-up/live boundary, never while the
    /// sink runs.
    ///
    /// Errors end the run without discarding the durable cursor:
    /// - `Subscribe` if either subscription cannot be opened
    /// - `ConnectionLost` if the broker connection drops
    /// - `Ack` if an acknowledgment is rejected
    pub async fn run(
        &self,
        topic: &str,
        sink: &dyn MessageSink,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let result = self.run_phases(topic, sink, &cancel).await;
        match &result {
            Ok(summary) => {
                self.set_phase(Phase::Cancelled);
                info!(
                    topic = %topic,
                    backlog = summary.backlog,
                    live = summary.live,
                    "Tailer cancelled"
                );
            }
            Err(e) => {
                self.set_phase(Phase::Closed);
                warn!(topic = %topic, error = %e, "Tailer stopped");
            }
        }
        result
    }

    async fn run_phases(
        &self,
        topic: &str,
        sink: &dyn MessageSink,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let durable = self.config.durable_name.as_str();
        let mut summary = RunSummary::default();

        self.set_phase(Phase::Draining);
        let mut catch_up = self
            .broker
            .subscribe(
                topic,
                SubscriptionOptions::durable(durable, StartPosition::Earliest),
            )
            .await?;
        info!(topic = %topic, durable = %durable, "Catch-up started");

        summary.backlog = self.drain(catch_up.as_mut(), sink).await?;

        self.set_phase(Phase::Switching);
        if cancel.is_cancelled() {
            info!(topic = %topic, backlog = summary.backlog, "Cancelled before tailing");
            bus::teardown(catch_up, self.config.cancel_teardown).await?;
            return Ok(summary);
        }
        bus::teardown(catch_up, self.config.catch_up_teardown).await?;
        info!(
            topic = %topic,
            durable = %durable,
            backlog = summary.backlog,
            teardown = ?self.config.catch_up_teardown,
            "Catch-up complete"
        );

        let mut live = self
            .broker
            .subscribe(
                topic,
                SubscriptionOptions::durable(durable, StartPosition::Now),
            )
            .await?;
        self.set_phase(Phase::Tailing);
        info!(topic = %topic, durable = %durable, "Tailing started");

        summary.live = self.tail(live.as_mut(), sink, cancel).await?;

        bus::teardown(live, self.config.cancel_teardown).await?;
        Ok(summary)
    }

    /// Deliver backlog until the idle timer fires.
    async fn drain(&self, sub: &mut dyn Subscription, sink: &dyn MessageSink) -> Result<u64> {
        let mut window = self.config.grace_period();
        let mut delivered = 0;

        loop {
            let delivery = match tokio::time::timeout(window, self.receive(sub)).await {
                Err(_) => {
                    debug!(window = ?window, delivered, "Idle window elapsed");
                    return Ok(delivered);
                }
                Ok(delivery) => delivery?,
            };

            Self::deliver(sub, sink, delivery).await?;
            delivered += 1;
            window = self.config.quiescence();
        }
    }

    /// Deliver live messages until cancelled.
    async fn tail(
        &self,
        sub: &mut dyn Subscription,
        sink: &dyn MessageSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut delivered = 0;

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(delivered),
                delivery = self.receive(sub) => delivery?,
            };

            Self::deliver(sub, sink, delivery).await?;
            delivered += 1;
        }
    }

    /// Wait for the next delivery, failing fast if the connection drops.
    async fn receive(&self, sub: &mut dyn Subscription) -> Result<Delivery> {
        tokio::select! {
            biased;
            _ = self.broker.connection_lost() => Err(BusError::ConnectionLost),
            delivery = sub.next() => delivery?.ok_or(BusError::ConnectionLost),
        }
    }

    async fn deliver(
        sub: &mut dyn Subscription,
        sink: &dyn MessageSink,
        delivery: Delivery,
    ) -> Result<()> {
        debug!(
            sequence = delivery.sequence,
            redelivered = delivery.redelivered,
            bytes = delivery.payload.len(),
            "Delivering message"
        );
        sink.handle(delivery.payload).await;
        sub.ack().await
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Tailer phase changed");
        }
    }
}

//! Tailgate - durable catch-up-then-tail consumer.
//!
//! Replays an ordered, at-least-once topic through a durable broker cursor,
//! detects the live edge with an idle timer, then keeps delivering new
//! messages under the same cursor until cancelled.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod publisher;
pub mod tailer;
pub mod utils;

pub use bus::{Broker, BusError, StartPosition, Subscription, SubscriptionOptions, Teardown};
pub use envelope::{Envelope, Metadata};
pub use publisher::Publisher;
pub use tailer::{CatchUpTailer, MessageSink, Phase, RunSummary, TailerConfig};

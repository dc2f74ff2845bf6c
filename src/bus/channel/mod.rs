//! In-process durable broker for standalone mode.
//!
//! Keeps one append-only log per topic and one cursor per
//! (topic, durable name). Delivery is single-in-flight: a subscription only
//! hands out the message after its cursor, and the cursor advances on ack.
//! Ideal for local development and testing without external dependencies.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    Broker, BusError, Delivery, Result, StartPosition, Subscription, SubscriptionOptions,
};

/// Append-only message log for one topic.
struct TopicLog {
    messages: Vec<Bytes>,
    /// Number of messages in the log; wakes waiting subscriptions.
    head: watch::Sender<u64>,
}

impl TopicLog {
    fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            messages: Vec::new(),
            head,
        }
    }
}

/// Durable cursor state.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Highest acknowledged sequence (0 = nothing acknowledged).
    acked: u64,
    /// Highest sequence ever handed out under this cursor.
    delivered: u64,
    /// Whether a subscription currently holds the cursor.
    active: bool,
}

type CursorKey = (String, String);

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    cursors: HashMap<CursorKey, Cursor>,
}

/// In-process broker with durable named subscriptions.
///
/// Cloning shares the same connection. `reconnect` hands out a fresh
/// connection over the same logs and cursors, which is how a restarted
/// process sees a broker that outlived it.
#[derive(Clone)]
pub struct ChannelBroker {
    state: Arc<Mutex<State>>,
    lost: Arc<watch::Sender<bool>>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        let (lost, _) = watch::channel(false);
        info!("Channel broker initialized");
        Self {
            state: Arc::new(Mutex::new(State::default())),
            lost: Arc::new(lost),
        }
    }

    /// Open a new connection to the same broker state.
    pub fn reconnect(&self) -> Self {
        let (lost, _) = watch::channel(false);
        Self {
            state: Arc::clone(&self.state),
            lost: Arc::new(lost),
        }
    }

    /// Drop this connection.
    ///
    /// Open subscriptions fail with `ConnectionLost`; later publishes fail
    /// with `BrokerUnavailable`.
    pub fn sever(&self) {
        warn!("Channel broker connection severed");
        self.lost.send_replace(true);
    }

    /// Number of messages retained on a topic.
    pub fn message_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.messages.len())
            .unwrap_or(0)
    }

    /// Highest acknowledged sequence of a durable cursor, if it exists.
    pub fn cursor_position(&self, topic: &str, durable_name: &str) -> Option<u64> {
        self.state
            .lock()
            .cursors
            .get(&(topic.to_string(), durable_name.to_string()))
            .map(|cursor| cursor.acked)
    }

    /// Whether a subscription currently holds the durable cursor.
    pub fn is_active(&self, topic: &str, durable_name: &str) -> bool {
        self.state
            .lock()
            .cursors
            .get(&(topic.to_string(), durable_name.to_string()))
            .map(|cursor| cursor.active)
            .unwrap_or(false)
    }

    fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.is_lost() {
            return Err(BusError::BrokerUnavailable(
                "channel broker connection lost".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicLog::new);
        log.messages.push(payload);
        let sequence = log.messages.len() as u64;
        log.head.send_replace(sequence);

        debug!(topic = %topic, sequence, "Published message to channel");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>> {
        if self.is_lost() {
            return Err(BusError::ConnectionLost);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicLog::new);
        let len = log.messages.len() as u64;
        let head = log.head.subscribe();

        let key = (topic.to_string(), options.durable_name.clone());
        match state.cursors.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().active {
                    return Err(BusError::Subscribe(format!(
                        "durable '{}' already active on topic '{}'",
                        options.durable_name, topic
                    )));
                }
                entry.get_mut().active = true;
                debug!(
                    topic = %topic,
                    durable = %options.durable_name,
                    acked = entry.get().acked,
                    "Resuming durable cursor"
                );
            }
            Entry::Vacant(entry) => {
                let acked = match options.start {
                    StartPosition::Earliest => 0,
                    StartPosition::Now => len,
                };
                entry.insert(Cursor {
                    acked,
                    delivered: acked,
                    active: true,
                });
                debug!(
                    topic = %topic,
                    durable = %options.durable_name,
                    start = ?options.start,
                    "Created durable cursor"
                );
            }
        }

        Ok(Box::new(ChannelSubscription {
            state: Arc::clone(&self.state),
            key,
            head,
            lost: self.lost.subscribe(),
            in_flight: None,
            released: false,
        }))
    }

    async fn connection_lost(&self) {
        let mut lost = self.lost.subscribe();
        if lost.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Subscription against a durable cursor on a `ChannelBroker`.
struct ChannelSubscription {
    state: Arc<Mutex<State>>,
    key: CursorKey,
    head: watch::Receiver<u64>,
    lost: watch::Receiver<bool>,
    in_flight: Option<u64>,
    released: bool,
}

impl ChannelSubscription {
    /// Hand out the message after the cursor, if the log has one.
    fn try_take(&mut self) -> Option<Delivery> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let cursor = state.cursors.get_mut(&self.key)?;
        let log = state.topics.get(&self.key.0)?;

        let sequence = cursor.acked + 1;
        let payload = log.messages.get((sequence - 1) as usize)?.clone();
        let redelivered = sequence <= cursor.delivered;
        cursor.delivered = cursor.delivered.max(sequence);
        self.in_flight = Some(sequence);

        Some(Delivery {
            payload,
            sequence,
            redelivered,
        })
    }

    fn release(&mut self, discard: bool) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.state.lock();
        if discard {
            state.cursors.remove(&self.key);
        } else if let Some(cursor) = state.cursors.get_mut(&self.key) {
            cursor.active = false;
        }
    }
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            if *self.lost.borrow() {
                return Err(BusError::ConnectionLost);
            }
            if let Some(delivery) = self.try_take() {
                return Ok(Some(delivery));
            }

            tokio::select! {
                changed = self.head.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                changed = self.lost.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn ack(&mut self) -> Result<()> {
        let sequence = self
            .in_flight
            .take()
            .ok_or_else(|| BusError::Ack("no outstanding delivery".to_string()))?;

        let mut state = self.state.lock();
        let cursor = state
            .cursors
            .get_mut(&self.key)
            .ok_or_else(|| BusError::Ack(format!("durable '{}' no longer exists", self.key.1)))?;
        cursor.acked = cursor.acked.max(sequence);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = self;
        debug!(topic = %this.key.0, durable = %this.key.1, "Closing channel subscription");
        this.release(false);
        Ok(())
    }

    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        let mut this = self;
        debug!(topic = %this.key.0, durable = %this.key.1, "Unsubscribing channel subscription");
        this.release(true);
        Ok(())
    }
}

impl Drop for ChannelSubscription {
    // Abandoned subscriptions keep their cursor; any unacked delivery is
    // handed out again to the next subscriber.
    fn drop(&mut self) {
        self.release(false);
    }
}

#[cfg(test)]
mod tests;

//! Mock broker implementation for testing.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{Broker, BusError, Result, Subscription, SubscriptionOptions};

/// Mock broker for testing.
///
/// Records publishes and injects failures. Subscriptions are refused.
#[derive(Default)]
pub struct MockBroker {
    published: RwLock<Vec<(String, Bytes)>>,
    fail_on_publish: RwLock<bool>,
    fail_on_subscribe: RwLock<bool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_subscribe(&self, fail: bool) {
        *self.fail_on_subscribe.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<(String, Bytes)> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::BrokerUnavailable(
                "Mock publish failure".to_string(),
            ));
        }
        self.published
            .write()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(
        &self,
        _topic: &str,
        options: SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>> {
        if *self.fail_on_subscribe.read().await {
            return Err(BusError::Subscribe(format!(
                "Mock subscribe failure for durable '{}'",
                options.durable_name
            )));
        }
        Err(BusError::SubscribeNotSupported)
    }

    async fn connection_lost(&self) {
        std::future::pending::<()>().await
    }
}

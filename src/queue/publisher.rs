//! One-shot message publishing over a pooled broker connection.

use crate::error::ConsumeError;
use crate::queue::broker::{Broker, BrokerChannel, BrokerConnection, BrokerPool};

/// Publishes messages to one queue.
///
/// Every call acquires the pooled connection for `resource`, so a broker
/// configuration change is picked up by the next publish.
pub struct Publisher<B: Broker> {
    pool: BrokerPool<B>,
    resource: String,
    queue: String,
    exchange: String,
    routing_key: Option<String>,
}

impl<B: Broker> Publisher<B> {
    /// Publish to `queue` through the default exchange.
    pub fn new(pool: BrokerPool<B>, resource: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            pool,
            resource: resource.into(),
            queue: queue.into(),
            exchange: String::new(),
            routing_key: None,
        }
    }

    /// Publish through `exchange`.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Route with `routing_key` instead of the queue name.
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Declare the queue and publish `body` as a persistent message.
    ///
    /// The channel is closed afterwards whether or not the publish succeeded.
    pub async fn publish(&self, body: &[u8]) -> Result<(), ConsumeError> {
        let connection = self.pool.acquire(&self.resource).await?;
        let channel = connection.open_channel().await?;
        let routing_key = self.routing_key.as_deref().unwrap_or(&self.queue);

        let result = match channel.declare_queue(&self.queue).await {
            Ok(()) => channel.publish(&self.exchange, routing_key, body).await,
            Err(e) => Err(e),
        };

        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "Failed to close publisher channel");
        }

        match &result {
            Ok(()) => tracing::debug!(
                resource = %self.resource,
                queue = %self.queue,
                bytes = body.len(),
                "Published message"
            ),
            Err(e) => tracing::warn!(
                resource = %self.resource,
                queue = %self.queue,
                error = %e,
                "Publish failed"
            ),
        }
        result
    }
}

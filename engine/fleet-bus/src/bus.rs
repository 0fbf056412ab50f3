// Event bus contract shared by every service in the fleet

use crate::delivery::Delivery;
use crate::exchange::ExchangeKind;
use crate::metrics::BusMetrics;
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Consumer callback invoked once per delivered message.
///
/// Delivery is at-least-once. An `Err` is caught at the subscription boundary, logged,
/// and the message is dropped; it never stops the consumer loop.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()>;
}

/// Publish/subscribe contract over named exchanges and durable queues.
///
/// `publish` is fire-and-forget: success only means the transport accepted the
/// message. Callers that publish as a side effect of a committed local write catch
/// and log the error instead of propagating it.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    /// Declare an exchange. Re-declaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare a queue. Re-declaring an existing queue is a no-op.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()>;

    /// Bind a queue to an exchange with a routing pattern
    async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Publish a payload to an exchange under a routing key
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()>;

    /// Deliver a message straight to a named queue (default exchange semantics).
    /// The delivery is forwarded as-is, body and headers untouched.
    async fn send_to_queue(&self, queue: &str, delivery: Delivery) -> Result<()>;

    /// Start consuming a queue. Messages are handed to `handler` in queue order.
    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle>;

    /// Message counters for this bus instance
    fn metrics(&self) -> Arc<BusMetrics>;
}

/// Serialize `payload` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn EventBus,
    exchange: &str,
    routing_key: &str,
    payload: &T,
) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    bus.publish(exchange, routing_key, body).await
}

/// Handle to a running consumer task
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(queue: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self { queue: queue.into(), task }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the consumer. Messages still in the queue stay there.
    pub fn abort(&self) {
        self.task.abort();
    }
}

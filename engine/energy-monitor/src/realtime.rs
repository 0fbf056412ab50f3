//! In-process topic hub for browser-facing real-time pushes.
//!
//! Topics are created on first subscription. Pushing to a topic nobody listens to is
//! not an error; the update is simply not delivered. Slow subscribers lag and miss
//! updates rather than slowing producers down.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const CHAT_ADMIN_TOPIC: &str = "chat.admin";

pub fn consumption_topic(device_id: Uuid) -> String {
    format!("consumption.{}", device_id)
}

pub fn device_notification_topic(device_id: Uuid) -> String {
    format!("notifications.device.{}", device_id)
}

pub fn chat_topic(user_id: &str) -> String {
    format!("chat.{}", user_id)
}

pub struct RealtimeHub {
    topics: DashMap<String, broadcast::Sender<Value>>,
    capacity: usize,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        Self { topics: DashMap::new(), capacity: capacity.max(1) }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Best-effort push. Returns how many subscribers received the update.
    pub fn push<T: Serialize>(&self, topic: &str, payload: &T) -> usize {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("RealtimeHub could not serialize update for {}: {}", topic, e);
                return 0;
            }
        };

        let Some(sender) = self.topics.get(topic) else {
            return 0;
        };
        match sender.send(value) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!("RealtimeHub topic {} has no live subscribers", topic);
                0
            }
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Drop topics whose subscribers have all gone away
    pub fn prune(&self) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, sender| sender.receiver_count() > 0);
        before - self.topics.len()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(256)
    }
}

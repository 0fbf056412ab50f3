//! Relays bus events to real-time topics

use crate::messages::{ChatEvent, ChatPush, OverconsumptionAlert, OverconsumptionPush};
use crate::metrics::MonitorMetrics;
use crate::realtime::{chat_topic, device_notification_topic, RealtimeHub, CHAT_ADMIN_TOPIC};
use crate::Result;
use anyhow::Context;
use fleet_bus::topology::{WEBSOCKET_CHAT_QUEUE, WEBSOCKET_OVERCONSUMPTION_QUEUE};
use fleet_bus::{Delivery, EventBus, MessageHandler, SubscriptionHandle};
use std::sync::Arc;

/// Text shown to device owners when an alert arrives
pub fn overconsumption_message(alert: &OverconsumptionAlert) -> String {
    format!(
        "Device '{}' has exceeded the energy consumption threshold! Current: {:.2} kWh/h, Threshold: {:.2} kWh/h",
        alert.device_name, alert.current_consumption, alert.threshold
    )
}

/// Pushes overconsumption alerts to every owner watching the device
pub struct NotificationRelay {
    hub: Arc<RealtimeHub>,
    metrics: Arc<MonitorMetrics>,
}

impl NotificationRelay {
    pub fn new(hub: Arc<RealtimeHub>, metrics: Arc<MonitorMetrics>) -> Self {
        Self { hub, metrics }
    }

    pub fn relay(&self, alert: OverconsumptionAlert) -> OverconsumptionPush {
        tracing::info!("Received overconsumption notification for device {}", alert.device_id);
        let topic = device_notification_topic(alert.device_id);
        let push = OverconsumptionPush { message: overconsumption_message(&alert), alert };
        self.hub.push(&topic, &push);
        self.metrics.notifications_relayed.inc();
        tracing::info!("Sent overconsumption notification to topic {}", topic);
        push
    }

    pub async fn start(self: Arc<Self>, bus: &dyn EventBus) -> Result<SubscriptionHandle> {
        Ok(bus.subscribe(WEBSOCKET_OVERCONSUMPTION_QUEUE, self).await?)
    }
}

#[async_trait::async_trait]
impl MessageHandler for NotificationRelay {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        let alert: OverconsumptionAlert = delivery.decode().context("undecodable overconsumption alert")?;
        self.relay(alert);
        Ok(())
    }
}

/// Pushes support chat messages to the user's topic and, for user/admin senders, the
/// admin topic
pub struct ChatRelay {
    hub: Arc<RealtimeHub>,
    metrics: Arc<MonitorMetrics>,
}

impl ChatRelay {
    pub fn new(hub: Arc<RealtimeHub>, metrics: Arc<MonitorMetrics>) -> Self {
        Self { hub, metrics }
    }

    /// Returns the topics the message was pushed to
    pub fn relay(&self, event: &ChatEvent) -> Vec<String> {
        tracing::info!("Received chat event for ticket {} from user {}", event.ticket_id, event.user_id);
        let push = ChatPush::from(event);

        let mut topics = vec![chat_topic(&push.user_id)];
        if matches!(event.sender.as_str(), "admin" | "user") {
            topics.push(CHAT_ADMIN_TOPIC.to_string());
        }
        for topic in &topics {
            self.hub.push(topic, &push);
        }
        self.metrics.chat_messages_relayed.inc();
        topics
    }

    pub async fn start(self: Arc<Self>, bus: &dyn EventBus) -> Result<SubscriptionHandle> {
        Ok(bus.subscribe(WEBSOCKET_CHAT_QUEUE, self).await?)
    }
}

#[async_trait::async_trait]
impl MessageHandler for ChatRelay {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        let event: ChatEvent = delivery.decode().context("undecodable chat event")?;
        self.relay(&event);
        Ok(())
    }
}

//! Publishing side of fact replication

use crate::messages::{DeviceEventMessage, UserEventMessage};
use crate::Result;
use fleet_bus::topology::{
    DEVICE_CREATE_KEY, DEVICE_DELETE_KEY, DEVICE_EVENTS_EXCHANGE, USER_CREATE_KEY, USER_DELETE_KEY,
    USER_EVENTS_EXCHANGE,
};
use fleet_bus::{publish_json, EventBus};
use std::sync::Arc;
use uuid::Uuid;

/// Emits fact events after the owning service has committed its local write.
///
/// Publishing never fails the caller: the write is already durable, so a bus error is
/// logged and the event is lost for this attempt.
#[derive(Clone)]
pub struct FactPublisher {
    bus: Arc<dyn EventBus>,
}

impl FactPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    pub async fn publish_user_created(&self, user_id: Uuid, email: &str, full_name: &str) {
        let message = UserEventMessage::created(user_id, email, full_name);
        self.log_outcome(
            "user",
            user_id,
            USER_CREATE_KEY,
            self.send(USER_EVENTS_EXCHANGE, USER_CREATE_KEY, &message).await,
        );
    }

    pub async fn publish_user_deleted(&self, user_id: Uuid) {
        let message = UserEventMessage::deleted(user_id);
        self.log_outcome(
            "user",
            user_id,
            USER_DELETE_KEY,
            self.send(USER_EVENTS_EXCHANGE, USER_DELETE_KEY, &message).await,
        );
    }

    pub async fn publish_device_created(&self, device_id: Uuid, name: &str, device_type: &str) {
        let message = DeviceEventMessage::created(device_id, name, device_type);
        self.log_outcome(
            "device",
            device_id,
            DEVICE_CREATE_KEY,
            self.send(DEVICE_EVENTS_EXCHANGE, DEVICE_CREATE_KEY, &message).await,
        );
    }

    pub async fn publish_device_deleted(&self, device_id: Uuid) {
        let message = DeviceEventMessage::deleted(device_id);
        self.log_outcome(
            "device",
            device_id,
            DEVICE_DELETE_KEY,
            self.send(DEVICE_EVENTS_EXCHANGE, DEVICE_DELETE_KEY, &message).await,
        );
    }

    async fn send<T: serde::Serialize + Sync>(&self, exchange: &str, key: &str, message: &T) -> Result<()> {
        publish_json(self.bus.as_ref(), exchange, key, message).await?;
        Ok(())
    }

    fn log_outcome(&self, domain: &str, id: Uuid, key: &str, result: Result<()>) {
        match result {
            Ok(()) => tracing::info!("FactPublisher published {} for {} {}", key, domain, id),
            Err(e) => tracing::error!("FactPublisher failed to publish {} for {} {}: {}", key, domain, id, e),
        }
    }
}

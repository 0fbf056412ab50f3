//! Exchange, routing key, and queue names shared by every service.
//!
//! These strings are the wire contract between independently deployed services;
//! changing one is a breaking change for every consumer bound to it.

use crate::bus::EventBus;
use crate::exchange::ExchangeKind;
use crate::Result;

pub const USER_EVENTS_EXCHANGE: &str = "user.events.exchange";
pub const USER_CREATE_KEY: &str = "user.create";
pub const USER_DELETE_KEY: &str = "user.delete";

pub const DEVICE_EVENTS_EXCHANGE: &str = "device.events.exchange";
pub const DEVICE_CREATE_KEY: &str = "device.create";
pub const DEVICE_DELETE_KEY: &str = "device.delete";

pub const DEVICE_MEASUREMENTS_EXCHANGE: &str = "device.measurements.exchange";
pub const DEVICE_MEASUREMENT_KEY: &str = "device.measurement";
/// Central queue drained by the load balancer's queue router
pub const DEVICE_MEASUREMENT_QUEUE: &str = "device.measurement.queue";

pub const OVERCONSUMPTION_EXCHANGE: &str = "overconsumption.notifications.exchange";
pub const OVERCONSUMPTION_KEY: &str = "overconsumption.notification";
pub const WEBSOCKET_OVERCONSUMPTION_QUEUE: &str = "websocket.overconsumption.queue";

pub const CHAT_EVENTS_EXCHANGE: &str = "chat.events.exchange";
pub const CHAT_MESSAGE_KEY: &str = "chat.message";
pub const WEBSOCKET_CHAT_QUEUE: &str = "websocket.chat.queue";

pub const INGEST_QUEUE_PREFIX: &str = "ingest.queue.";

/// Replica-private ingest queue. Ordinals start at 1.
pub fn ingest_queue(ordinal: usize) -> String {
    format!("{}{}", INGEST_QUEUE_PREFIX, ordinal)
}

/// Per-service queue receiving user fact events, e.g. `device.user.queue`
pub fn user_queue(service: &str) -> String {
    format!("{}.user.queue", service)
}

/// Per-service queue receiving device fact events, e.g. `monitoring.device.queue`
pub fn device_queue(service: &str) -> String {
    format!("{}.device.queue", service)
}

/// Declare every shared exchange plus the central queues and their bindings.
/// Safe to call from every process; declarations are idempotent.
pub async fn declare_fleet_topology(bus: &dyn EventBus) -> Result<()> {
    for exchange in [
        USER_EVENTS_EXCHANGE,
        DEVICE_EVENTS_EXCHANGE,
        DEVICE_MEASUREMENTS_EXCHANGE,
        OVERCONSUMPTION_EXCHANGE,
        CHAT_EVENTS_EXCHANGE,
    ] {
        bus.declare_exchange(exchange, ExchangeKind::Topic).await?;
    }

    let central = [
        (DEVICE_MEASUREMENT_QUEUE, DEVICE_MEASUREMENTS_EXCHANGE, DEVICE_MEASUREMENT_KEY),
        (WEBSOCKET_OVERCONSUMPTION_QUEUE, OVERCONSUMPTION_EXCHANGE, OVERCONSUMPTION_KEY),
        (WEBSOCKET_CHAT_QUEUE, CHAT_EVENTS_EXCHANGE, CHAT_MESSAGE_KEY),
    ];
    for (queue, exchange, key) in central {
        bus.declare_queue(queue, true).await?;
        bus.bind(queue, exchange, key).await?;
    }

    tracing::info!("FleetBus topology declared");
    Ok(())
}

/// Declare the ingest queues `ingest.queue.1..=replicas`
pub async fn declare_ingest_queues(bus: &dyn EventBus, replicas: usize) -> Result<()> {
    for ordinal in 1..=replicas {
        bus.declare_queue(&ingest_queue(ordinal), true).await?;
    }
    Ok(())
}

/// Declare and bind a service's private user and device fact queues
pub async fn declare_service_queues(bus: &dyn EventBus, service: &str) -> Result<()> {
    let users = user_queue(service);
    bus.declare_queue(&users, true).await?;
    bus.bind(&users, USER_EVENTS_EXCHANGE, USER_CREATE_KEY).await?;
    bus.bind(&users, USER_EVENTS_EXCHANGE, USER_DELETE_KEY).await?;

    let devices = device_queue(service);
    bus.declare_queue(&devices, true).await?;
    bus.bind(&devices, DEVICE_EVENTS_EXCHANGE, DEVICE_CREATE_KEY).await?;
    bus.bind(&devices, DEVICE_EVENTS_EXCHANGE, DEVICE_DELETE_KEY).await?;
    Ok(())
}

//! Monitoring counters

use fleet_bus::AtomicCounter;

#[derive(Debug, Default)]
pub struct MonitorMetrics {
    pub measurements_processed: AtomicCounter,
    pub measurements_unknown_device: AtomicCounter,
    pub alerts_fired: AtomicCounter,
    pub alert_publish_failures: AtomicCounter,
    pub realtime_pushes: AtomicCounter,
    pub notifications_relayed: AtomicCounter,
    pub chat_messages_relayed: AtomicCounter,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> String {
        format!(
            "processed={} unknown_device={} alerts={} alert_publish_failures={} pushes={} relayed_notifications={} relayed_chat={}",
            self.measurements_processed.get(),
            self.measurements_unknown_device.get(),
            self.alerts_fired.get(),
            self.alert_publish_failures.get(),
            self.realtime_pushes.get(),
            self.notifications_relayed.get(),
            self.chat_messages_relayed.get()
        )
    }
}

//! Payloads consumed, published and pushed by the monitor

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One telemetry reading, as emitted by the device simulators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementMessage {
    pub timestamp: NaiveDateTime,
    pub device_id: Uuid,
    pub measurement_value: f64,
}

/// Published when a device's hourly total crosses the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverconsumptionAlert {
    pub device_id: Uuid,
    /// Always `None`: a device may have several owners
    pub user_id: Option<Uuid>,
    pub device_name: String,
    pub current_consumption: f64,
    pub threshold: f64,
    pub timestamp: NaiveDateTime,
}

/// Alert as pushed to browsers, with a human-readable message attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverconsumptionPush {
    #[serde(flatten)]
    pub alert: OverconsumptionAlert,
    pub message: String,
}

/// Pushed on `consumption.{deviceId}` after every measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConsumption {
    pub device_id: Uuid,
    pub timestamp: NaiveDateTime,
    pub consumption: f64,
    pub hour_timestamp: NaiveDateTime,
    pub hourly_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyConsumption {
    pub hour_timestamp: NaiveDateTime,
    pub consumption: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyConsumption {
    pub device_id: Uuid,
    pub date: NaiveDate,
    pub total_consumption: f64,
    pub hourly_consumptions: Vec<HourlyConsumption>,
}

/// Chat message published by the support service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub ticket_id: Uuid,
    pub user_id: Uuid,
    /// `user`, `bot` or `admin`
    pub sender: String,
    pub message: String,
    pub timestamp: String,
}

/// Chat message as pushed to browsers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPush {
    pub ticket_id: String,
    pub user_id: String,
    pub sender: String,
    pub text: String,
    pub timestamp: String,
}

impl From<&ChatEvent> for ChatPush {
    fn from(event: &ChatEvent) -> Self {
        Self {
            ticket_id: event.ticket_id.to_string(),
            user_id: event.user_id.to_string(),
            sender: event.sender.clone(),
            text: event.message.clone(),
            timestamp: event.timestamp.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_parses_local_timestamp() {
        let raw = r#"{"timestamp":"2024-01-15T10:05:30","deviceId":"6f9619ff-8b86-d011-b42d-00cf4fc964ff","measurementValue":0.42}"#;
        let message: MeasurementMessage = serde_json::from_str(raw).unwrap();

        assert_eq!(message.measurement_value, 0.42);
        assert_eq!(message.timestamp.to_string(), "2024-01-15 10:05:30");
    }

    #[test]
    fn test_push_flattens_alert_fields() {
        let alert = OverconsumptionAlert {
            device_id: Uuid::nil(),
            user_id: None,
            device_name: "Heater".to_string(),
            current_consumption: 110.0,
            threshold: 100.0,
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(10, 0, 0).unwrap(),
        };
        let value = serde_json::to_value(OverconsumptionPush { alert, message: "m".to_string() }).unwrap();

        assert_eq!(value["deviceName"], "Heater");
        assert_eq!(value["userId"], serde_json::Value::Null);
        assert_eq!(value["message"], "m");
        assert_eq!(value["timestamp"], "2024-01-15T10:00:00");
    }
}

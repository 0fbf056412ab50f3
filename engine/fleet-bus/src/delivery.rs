use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message as it travels through the bus.
///
/// The body is opaque bytes; only the final consumer decodes it. Routers that move a
/// delivery between queues must forward it untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Exchange the message was originally published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Transport headers (content type hints, type ids, etc.)
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers: BTreeMap::new(),
            content_type: None,
            body,
        }
    }

    /// Serialize `payload` as JSON into a new delivery
    pub fn json<T: Serialize>(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &T,
    ) -> crate::Result<Self> {
        let body = serde_json::to_vec(payload)?;
        let mut delivery = Self::new(exchange, routing_key, body);
        delivery.content_type = Some(CONTENT_TYPE_JSON.to_string());
        Ok(delivery)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Decode the body as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        device_id: String,
        measurement_value: f64,
    }

    #[test]
    fn test_json_delivery_sets_content_type() {
        let sample = Sample { device_id: "abc".to_string(), measurement_value: 1.5 };
        let delivery = Delivery::json("x", "k", &sample).unwrap();

        assert_eq!(delivery.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(delivery.decode::<Sample>().unwrap(), sample);
        assert!(String::from_utf8_lossy(&delivery.body).contains("measurementValue"));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let delivery = Delivery::new("x", "k", b"not json".to_vec());
        assert!(delivery.decode::<Sample>().is_err());
    }
}

//! # Telemetry Record
//!
//! The unit of data that flows from the broker to every viewer. A record is built
//! once by the decoder, shared behind an `Arc` during fan-out and dropped as soon as
//! the last session has consumed it. Nothing is retained.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Field name of the temperature reading.
pub const TEMPERATURE: &str = "temperature";
/// Field name of the relative humidity reading.
pub const HUMIDITY: &str = "humidity";

/// # Telemetry Record
///
/// One decoded sensor reading. Known fields keep the JSON number exactly as it was
/// published, so a sensor sending `28` is re-emitted as `28` and not `28.0`. Any
/// other fields the sensor added travel in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity: Option<Number>,
    #[serde(flatten)]
    extra: Map<String, Value>,
    /// Receive time. Used for logging and staleness checks, never sent to viewers.
    #[serde(skip)]
    received_at: DateTime<Utc>,
}

impl TelemetryRecord {
    pub(crate) fn new(
        temperature: Option<Number>,
        humidity: Option<Number>,
        extra: Map<String, Value>,
    ) -> Self {
        Self {
            temperature,
            humidity,
            extra,
            received_at: Utc::now(),
        }
    }

    /// Temperature in the sensor's unit, if the message carried one.
    pub fn temperature(&self) -> Option<f64> {
        self.temperature.as_ref().and_then(Number::as_f64)
    }

    /// Relative humidity, if the message carried one.
    pub fn humidity(&self) -> Option<f64> {
        self.humidity.as_ref().and_then(Number::as_f64)
    }

    /// Fields other than the two known readings.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// When the relay decoded this record.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// True when the message carried neither reading.
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none()
    }

    /// The JSON object handed to viewers.
    pub fn to_payload(&self) -> Value {
        let mut object = Map::with_capacity(self.extra.len() + 2);
        if let Some(t) = &self.temperature {
            object.insert(TEMPERATURE.to_string(), Value::Number(t.clone()));
        }
        if let Some(h) = &self.humidity {
            object.insert(HUMIDITY.to_string(), Value::Number(h.clone()));
        }
        for (key, value) in &self.extra {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_keeps_integer_numbers_as_published() {
        let record = TelemetryRecord::new(
            Some(Number::from_f64(31.1).unwrap()),
            Some(Number::from(28)),
            Map::new(),
        );

        assert_eq!(
            serde_json::to_string(&record.to_payload()).unwrap(),
            r#"{"temperature":31.1,"humidity":28}"#
        );
        assert_eq!(record.humidity(), Some(28.0));
    }

    #[test]
    fn serialize_matches_payload_and_skips_receive_time() {
        let mut extra = Map::new();
        extra.insert("device".into(), json!("esp32-kitchen"));
        let record = TelemetryRecord::new(None, Some(Number::from(40)), extra);

        let serialized = serde_json::to_value(&record).unwrap();
        assert_eq!(serialized, record.to_payload());
        assert!(serialized.get("received_at").is_none());
        assert!(!record.is_empty());
    }
}

//! # Payload Decoder
//!
//! Turns the raw body of a broker message into a [`TelemetryRecord`]. The body is
//! expected to be UTF-8 text holding one JSON object. Anything else is rejected with
//! [`DecodeError::Malformed`] and the caller drops the message.

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::core::record::{HUMIDITY, TEMPERATURE, TelemetryRecord};

/// Why a payload could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The body is not valid UTF-8 JSON, or the JSON is not an object.
    #[error("malformed telemetry payload: {0}")]
    Malformed(String),
}

/// Decodes one message body.
///
/// An object without either reading is still a valid (empty) record. Extra fields are
/// kept as they are. A known field that cannot be read as a finite number is left out
/// of the record.
pub fn decode(bytes: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(DecodeError::Malformed(format!(
                "expected a JSON object, got {}",
                kind_of(&other)
            )));
        }
    };

    let temperature = take_reading(&mut object, TEMPERATURE);
    let humidity = take_reading(&mut object, HUMIDITY);

    Ok(TelemetryRecord::new(temperature, humidity, object))
}

fn take_reading(object: &mut Map<String, Value>, field: &str) -> Option<Number> {
    let raw = object.remove(field)?;
    let number = coerce_number(&raw);
    if number.is_none() {
        log::warn!("Dropping non-numeric '{}' field: {}", field, raw);
    }
    number
}

fn coerce_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => {
            let trimmed = s.trim();
            // Integers stay integers so they are re-emitted without a fraction.
            if let Ok(i) = trimmed.parse::<i64>() {
                return Some(Number::from(i));
            }
            trimmed.parse::<f64>().ok().and_then(Number::from_f64)
        }
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

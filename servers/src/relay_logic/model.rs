use lib_relay::{BrokerLinkState, StatsSnapshot, TelemetryRecord};
use serde::Serialize;

/// Event name viewers listen for.
pub const TELEMETRY_EVENT: &str = "mqtt_data";

/// Frame pushed to viewers: `{"event":"mqtt_data","data":{...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMessage<'a> {
    pub event: &'static str,
    pub data: &'a TelemetryRecord,
}

impl<'a> ServerMessage<'a> {
    pub fn telemetry(record: &'a TelemetryRecord) -> Self {
        Self {
            event: TELEMETRY_EVENT,
            data: record,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub broker: BrokerLinkState,
    pub sessions: usize,
    pub uptime_seconds: i64,
    pub relay: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_frame_wraps_the_payload_unmodified() {
        let record = lib_relay::decode(br#"{"temperature":31.1,"humidity":28}"#).unwrap();
        let text = serde_json::to_string(&ServerMessage::telemetry(&record)).unwrap();
        assert_eq!(
            text,
            r#"{"event":"mqtt_data","data":{"temperature":31.1,"humidity":28}}"#
        );
    }
}

//! # Core Relay Module
//!
//! Everything between a decoded broker message and a viewer's inbox.
//!
//! ## Core Components:
//!
//! - **`record`**: The `TelemetryRecord` that flows through the relay.
//!
//! - **`decoder`**: Pure function from a raw message body to a record or a
//!   `DecodeError`.
//!
//! - **`registry`**: The set of live viewer sessions and the zero-copy broadcaster
//!   that fans each record out to them.
//!
//! - **`relay`**: The coordinator that drains decoded records from the ingestion
//!   channel into the registry, plus the shared counters.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Telemetry record type.
pub mod record;
/// Payload decoding.
pub mod decoder;
/// Viewer session registry and broadcast.
pub mod registry;
/// Ingestion-to-broadcast coordinator.
pub mod relay;

// --- Public API Re-exports ---
pub use decoder::{DecodeError, decode};
pub use record::TelemetryRecord;
pub use registry::{
    BroadcastReport, RegistryError, SessionHandle, SessionId, SessionInbox, SessionRegistry,
    SessionSendError, session_channel,
};
pub use relay::{Relay, RelayStats, StatsSnapshot, RecordSink, RecordSource, record_channel};

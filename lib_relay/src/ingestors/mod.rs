//! # Data Ingestors Module
//!
//! Upstream side of the relay: the broker link that keeps the MQTT subscription
//! alive, the transport seam it talks through, and a scripted transport for tests.
//!
//! ## Contained Modules:
//! - **`broker_link`**: connection lifecycle, reconnect backoff and per-message
//!   decoding.
//! - **`transport`**: the `BrokerTransport` trait and its `rumqttc` implementation.
//! - **`mock`**: a `BrokerTransport` driven by hand, used by the test suites.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// MQTT connection lifecycle and message intake.
pub mod broker_link;
/// Transport abstraction over the MQTT client.
pub mod transport;
/// Scripted transport for tests.
pub mod mock;

// --- Public API Re-exports ---
pub use broker_link::{Backoff, BrokerConfig, BrokerConfigError, BrokerLink, BrokerLinkHandle, BrokerLinkState, DEFAULT_TOPIC};
pub use transport::{BrokerTransport, ConnectionError, MqttTransport, TransportEvent, client_id, mqtt_options};

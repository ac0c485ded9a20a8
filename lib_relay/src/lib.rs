//! # lib_relay
//!
//! Relays DHT11 temperature/humidity readings from an MQTT topic to any number of
//! live viewer sessions.
//!
//! Data flow: sensor -> broker -> [`BrokerLink`] (receive + [`decode`]) ->
//! [`Relay`] -> [`SessionRegistry::broadcast`] -> every viewer inbox.
//!
//! The binaries in `servers` and `cli` wire these parts to a WebSocket server and to
//! command-line test tools.

#![forbid(unsafe_code)]

pub mod core;
pub mod ingestors;

// Re-export everything a server needs to wire the relay together.
pub use crate::core::*;
pub use ingestors::*;

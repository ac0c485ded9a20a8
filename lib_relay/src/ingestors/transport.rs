//! # Broker Transport
//!
//! The seam between the broker link's state machine and the wire. Production code
//! uses [`MqttTransport`], a thin wrapper around the `rumqttc` client and event loop.
//! Tests drive the link with a scripted transport instead.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use thiserror::Error;
use uuid::Uuid;

use crate::ingestors::broker_link::BrokerConfig;

/// Capacity of the request queue between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 10;

/// Broker connectivity failures. All of them are retried by the broker link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The connection could not be established or was lost.
    #[error("broker transport failed: {0}")]
    Transport(String),
    /// The subscription request could not be issued.
    #[error("subscription request failed: {0}")]
    Subscribe(String),
}

impl From<rumqttc::ConnectionError> for ConnectionError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}

/// What the transport observed on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed (CONNACK accepted).
    Connected,
    /// A message arrived.
    Publish {
        /// Topic the message was published on.
        topic: String,
        /// Raw message body.
        payload: Bytes,
    },
    /// Anything else (pings, acks, outgoing packets).
    Other,
}

/// A connection to a message broker, polled by a single task.
pub trait BrokerTransport: Send + 'static {
    /// Waits for the next event. Calling again after an error starts a new
    /// connection attempt.
    fn next_event(&mut self) -> impl Future<Output = Result<TransportEvent, ConnectionError>> + Send;

    /// Issues a subscription for `topic` on the current connection.
    fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError>;

    /// Closes the connection.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Builds a unique client id such as `dht-relay-6f1c...`.
pub fn client_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Connection options shared by the relay and the command-line tools.
pub fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        client_id(&config.client_id_prefix),
        config.host.clone(),
        config.port,
    );
    // rumqttc rejects keepalives below one second.
    options.set_keep_alive(config.keep_alive.max(Duration::from_secs(1)));
    options.set_clean_session(true);
    options
}

/// # MQTT Transport
///
/// `rumqttc` reconnects on the next `poll` after a failure, so the broker link only
/// needs to keep polling (with its own backoff in between).
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    // Set by CONNACK, cleared by any poll error.
    connected: bool,
}

impl MqttTransport {
    /// Prepares a client for `config`. Nothing touches the network until the first
    /// `next_event`.
    pub fn new(config: &BrokerConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        Self {
            client,
            eventloop,
            connected: false,
        }
    }
}

impl BrokerTransport for MqttTransport {
    async fn next_event(&mut self) -> Result<TransportEvent, ConnectionError> {
        let event = match self.eventloop.poll().await {
            Ok(event) => event,
            Err(e) => {
                self.connected = false;
                return Err(e.into());
            }
        };
        Ok(match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.connected = true;
                log::debug!("CONNACK received (session present: {})", ack.session_present);
                TransportEvent::Connected
            }
            Event::Incoming(Packet::Publish(publish)) => TransportEvent::Publish {
                topic: publish.topic,
                payload: publish.payload,
            },
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    log::error!("Broker refused subscription (packet id {})", ack.pkid);
                }
                TransportEvent::Other
            }
            other => {
                log::trace!("MQTT event: {:?}", other);
                TransportEvent::Other
            }
        })
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        // At-most-once: readings lost in flight are simply superseded by the next one.
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| ConnectionError::Subscribe(e.to_string()))
    }

    async fn disconnect(&mut self) {
        // Polling a disconnected event loop would dial the broker again.
        if !self.connected {
            return;
        }
        self.connected = false;
        if self.client.try_disconnect().is_err() {
            return;
        }
        // Drive the event loop until the DISCONNECT has been written.
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), flush).await.is_err() {
            log::debug!("Timed out flushing MQTT disconnect.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_prefixed_and_unique() {
        let a = client_id("dht-relay");
        let b = client_id("dht-relay");
        assert!(a.starts_with("dht-relay-"));
        assert_ne!(a, b);
    }

    #[test]
    fn options_follow_config() {
        let config = BrokerConfig {
            host: "broker.local".into(),
            port: 1884,
            keep_alive: Duration::from_secs(15),
            ..BrokerConfig::default()
        };
        let options = mqtt_options(&config);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert!(options.clean_session());
    }

    #[tokio::test]
    async fn disconnect_without_a_connection_does_not_dial_the_broker() {
        // Non-routable address: any connection attempt would hang until a timeout.
        let config = BrokerConfig {
            host: "10.255.255.1".into(),
            ..BrokerConfig::default()
        };
        let mut transport = MqttTransport::new(&config);
        assert!(!transport.connected);

        tokio::time::timeout(Duration::from_millis(200), transport.disconnect())
            .await
            .expect("disconnect tried to reach the broker");
    }

    #[test]
    fn sub_second_keepalive_is_raised() {
        let config = BrokerConfig {
            keep_alive: Duration::from_millis(10),
            ..BrokerConfig::default()
        };
        assert_eq!(mqtt_options(&config).keep_alive(), Duration::from_secs(1));
    }
}

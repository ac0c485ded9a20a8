//! # Broker Link
//!
//! Keeps one subscription to the configured topic alive for as long as the process
//! runs and surfaces every successfully decoded message to the relay.
//!
//! ## State machine
//!
//! ```text
//! Disconnected --start--> Connecting --handshake--> Connected --subscribe--> Subscribed
//!                              ^                                                 |
//!                              +------------- transport error (backoff) ---------+
//! ```
//!
//! Retries never give up. The delay between attempts doubles from
//! `reconnect_base_delay` up to `reconnect_max_delay` and resets after each
//! successful handshake. Messages published while the link is down are lost.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::mqttbytes::{matches, valid_filter};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::decoder::decode;
use crate::core::relay::{RecordSink, RelayStats};
use crate::ingestors::transport::{BrokerTransport, MqttTransport, TransportEvent};

/// Topic the DHT11 sensor nodes publish on.
pub const DEFAULT_TOPIC: &str = "esp32/sensors/dht11";

/// Connection parameters for the broker link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Topic filter to subscribe to.
    pub topic: String,
    /// MQTT keepalive interval.
    pub keep_alive: Duration,
    /// Prefix of the generated MQTT client id.
    pub client_id_prefix: String,
    /// First retry delay after a failure.
    pub reconnect_base_delay: Duration,
    /// Upper bound of the retry delay.
    pub reconnect_max_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            topic: DEFAULT_TOPIC.to_string(),
            keep_alive: Duration::from_secs(60),
            client_id_prefix: "dht-relay".to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Broker settings rejected at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerConfigError {
    /// No broker host given.
    #[error("broker host is empty")]
    EmptyHost,
    /// The topic is not a valid MQTT topic filter.
    #[error("invalid MQTT topic filter '{0}'")]
    InvalidTopic(String),
}

impl BrokerConfig {
    /// Checks the settings that would otherwise only fail once connected.
    pub fn validate(&self) -> Result<(), BrokerConfigError> {
        if self.host.trim().is_empty() {
            return Err(BrokerConfigError::EmptyHost);
        }
        if self.topic.is_empty() || !valid_filter(&self.topic) {
            return Err(BrokerConfigError::InvalidTopic(self.topic.clone()));
        }
        Ok(())
    }
}

/// Lifecycle state of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerLinkState {
    /// Not running (initial, and after `stop`).
    Disconnected,
    /// Attempting, or waiting to retry, a connection.
    Connecting,
    /// Handshake done, subscription not yet issued.
    Connected,
    /// Subscribed and receiving.
    Subscribed,
}

/// Shortest wait between two connection attempts.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Starts at `base`, doubling up to `max`. A zero `base` is raised to one
    /// millisecond so a refusing broker is never retried in a busy loop.
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_RETRY_DELAY);
        let max = max.max(base);
        Self { base, max, next: base }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to `base` after a success.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

/// # Broker Link
///
/// Owns the transport. Exactly one task drives it; nothing else may touch the
/// broker connection.
pub struct BrokerLink<T: BrokerTransport> {
    transport: T,
    config: BrokerConfig,
    sink: RecordSink,
    stats: Arc<RelayStats>,
    state: watch::Sender<BrokerLinkState>,
    cancel: CancellationToken,
}

impl BrokerLink<MqttTransport> {
    /// Starts the link against a real MQTT broker. Returns immediately; the
    /// lifecycle runs on a background task.
    pub fn start(config: BrokerConfig, sink: RecordSink, stats: Arc<RelayStats>) -> BrokerLinkHandle {
        let transport = MqttTransport::new(&config);
        Self::start_with(transport, config, sink, stats)
    }
}

impl<T: BrokerTransport> BrokerLink<T> {
    /// Starts the link over any transport.
    pub fn start_with(
        transport: T,
        config: BrokerConfig,
        sink: RecordSink,
        stats: Arc<RelayStats>,
    ) -> BrokerLinkHandle {
        let (state, state_rx) = watch::channel(BrokerLinkState::Disconnected);
        let cancel = CancellationToken::new();
        let link = Self {
            transport,
            config,
            sink,
            stats,
            state,
            cancel: cancel.clone(),
        };

        BrokerLinkHandle {
            state: state_rx,
            cancel,
            task: Some(tokio::spawn(link.run())),
        }
    }

    fn set_state(&self, next: BrokerLinkState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::info!("Broker link: {:?} -> {:?}", *current, next);
            *current = next;
            true
        });
    }

    fn current_state(&self) -> BrokerLinkState {
        *self.state.borrow()
    }

    async fn run(mut self) {
        log::info!(
            "Broker link starting: {}:{} topic '{}'",
            self.config.host,
            self.config.port,
            self.config.topic
        );
        self.set_state(BrokerLinkState::Connecting);
        let mut backoff = Backoff::new(
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
        );

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.transport.next_event() => event,
            };

            match event {
                Ok(TransportEvent::Connected) => {
                    backoff.reset();
                    self.set_state(BrokerLinkState::Connected);
                    self.issue_subscription();
                }
                Ok(TransportEvent::Publish { topic, payload }) => {
                    self.handle_publish(&topic, &payload);
                }
                Ok(TransportEvent::Other) => {}
                Err(e) => {
                    let delay = backoff.next_delay();
                    log::error!("{}. Retrying in {:?}...", e, delay);
                    self.set_state(BrokerLinkState::Connecting);
                    let resumed = tokio::select! {
                        _ = self.cancel.cancelled() => false,
                        _ = tokio::time::sleep(delay) => true,
                    };
                    if !resumed {
                        break;
                    }
                }
            }

            // A subscription that could not be queued is retried on the next event.
            if self.current_state() == BrokerLinkState::Connected {
                self.issue_subscription();
            }
        }

        self.transport.disconnect().await;
        self.set_state(BrokerLinkState::Disconnected);
        log::info!("Broker link stopped.");
    }

    fn issue_subscription(&mut self) {
        match self.transport.subscribe(&self.config.topic) {
            Ok(()) => {
                log::info!("Subscribed to topic: {}", self.config.topic);
                self.set_state(BrokerLinkState::Subscribed);
            }
            Err(e) => log::error!("{}", e),
        }
    }

    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        if !matches(topic, &self.config.topic) {
            log::debug!("Ignoring message on unrelated topic {}", topic);
            return;
        }
        self.stats.record_received();

        match decode(payload) {
            Ok(record) => {
                if self.sink.send(record).is_err() {
                    log::warn!("Relay is not running; dropping record from {}", topic);
                }
            }
            Err(e) => {
                self.stats.record_malformed();
                log::warn!(
                    "Received non-json data on {}: {:?} ({})",
                    topic,
                    String::from_utf8_lossy(payload),
                    e
                );
            }
        }
    }
}

/// # Broker Link Handle
///
/// Returned by `start`. Dropping the handle stops the link.
pub struct BrokerLinkHandle {
    state: watch::Receiver<BrokerLinkState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BrokerLinkHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> BrokerLinkState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<BrokerLinkState> {
        self.state.clone()
    }

    /// Terminates the lifecycle and releases the connection. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("Stopping broker link...");
            self.cancel.cancel();
        }
    }

    /// Stops the link and waits for the connection to be released.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Broker link task failed: {}", e);
            }
        }
    }
}

impl Drop for BrokerLinkHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relay::record_channel;
    use crate::ingestors::mock::ScriptedTransport;

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(4),
            ..BrokerConfig::default()
        }
    }

    async fn reach(rx: &mut watch::Receiver<BrokerLinkState>, target: BrokerLinkState) {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached in time")
            .expect("link task ended");
    }

    #[test]
    fn backoff_doubles_up_to_the_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn zero_base_delay_still_waits_and_grows() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_millis(4));
        let delays: Vec<Duration> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(4),
            ]
        );
        assert!(delays.iter().all(|d| !d.is_zero()));
    }

    #[test]
    fn defaults_match_the_sensor_deployment() {
        let config = BrokerConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic, "esp32/sensors/dht11");
        assert_eq!(config.keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn validate_rejects_bad_topic_filters_and_empty_host() {
        assert!(BrokerConfig::default().validate().is_ok());

        let wildcard = BrokerConfig {
            topic: "esp32/sensors/#".into(),
            ..BrokerConfig::default()
        };
        assert!(wildcard.validate().is_ok());

        let broken = BrokerConfig {
            topic: "esp32/#/dht11".into(),
            ..BrokerConfig::default()
        };
        assert_eq!(
            broken.validate(),
            Err(BrokerConfigError::InvalidTopic("esp32/#/dht11".into()))
        );

        let no_host = BrokerConfig {
            host: " ".into(),
            ..BrokerConfig::default()
        };
        assert_eq!(no_host.validate(), Err(BrokerConfigError::EmptyHost));
    }

    #[tokio::test]
    async fn subscribes_after_handshake_and_forwards_decoded_records() {
        let (transport, script) = ScriptedTransport::new();
        let (sink, mut source) = record_channel();
        let stats = Arc::new(RelayStats::default());
        let handle = BrokerLink::start_with(transport, fast_config(), sink, stats.clone());
        let mut states = handle.subscribe_state();

        reach(&mut states, BrokerLinkState::Connecting).await;
        script.connect();
        reach(&mut states, BrokerLinkState::Subscribed).await;
        assert_eq!(script.subscriptions(), vec![DEFAULT_TOPIC.to_string()]);

        script.publish(DEFAULT_TOPIC, r#"{"temperature":31.1,"humidity":28}"#);
        let record = source.recv().await.unwrap();
        assert_eq!(record.temperature(), Some(31.1));
        assert_eq!(stats.snapshot().received, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_ingestion_continues() {
        let (transport, script) = ScriptedTransport::new();
        let (sink, mut source) = record_channel();
        let stats = Arc::new(RelayStats::default());
        let handle = BrokerLink::start_with(transport, fast_config(), sink, stats.clone());

        script.connect();
        script.publish(DEFAULT_TOPIC, "oops");
        script.publish(DEFAULT_TOPIC, "[1,2,3]");
        script.publish(DEFAULT_TOPIC, r#"{"temperature":22,"humidity":41}"#);

        let record = source.recv().await.unwrap();
        assert_eq!(record.humidity(), Some(41.0));
        assert!(source.try_recv().is_err());
        assert_eq!(stats.snapshot().malformed, 2);
        assert_eq!(handle.state(), BrokerLinkState::Subscribed);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unrelated_topics_are_ignored() {
        let (transport, script) = ScriptedTransport::new();
        let (sink, mut source) = record_channel();
        let stats = Arc::new(RelayStats::default());
        let handle = BrokerLink::start_with(transport, fast_config(), sink, stats.clone());

        script.connect();
        script.publish("esp32/sensors/other", r#"{"temperature":1}"#);
        script.publish(DEFAULT_TOPIC, r#"{"temperature":2}"#);

        assert_eq!(source.recv().await.unwrap().temperature(), Some(2.0));
        assert_eq!(stats.snapshot().received, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes_after_connection_loss() {
        let (transport, script) = ScriptedTransport::new();
        let (sink, mut source) = record_channel();
        let handle = BrokerLink::start_with(
            transport,
            fast_config(),
            sink,
            Arc::new(RelayStats::default()),
        );
        let mut states = handle.subscribe_state();

        script.connect();
        reach(&mut states, BrokerLinkState::Subscribed).await;

        script.drop_connection("connection reset by peer");
        reach(&mut states, BrokerLinkState::Connecting).await;

        script.drop_connection("connection refused");
        script.connect();
        reach(&mut states, BrokerLinkState::Subscribed).await;
        assert_eq!(script.subscriptions().len(), 2);

        script.publish(DEFAULT_TOPIC, r#"{"temperature":19.5,"humidity":60}"#);
        assert_eq!(source.recv().await.unwrap().temperature(), Some(19.5));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_the_connection() {
        let (transport, script) = ScriptedTransport::new();
        let (sink, _source) = record_channel();
        let handle = BrokerLink::start_with(
            transport,
            fast_config(),
            sink,
            Arc::new(RelayStats::default()),
        );
        let mut states = handle.subscribe_state();
        script.connect();
        reach(&mut states, BrokerLinkState::Subscribed).await;

        handle.stop();
        handle.stop();
        reach(&mut states, BrokerLinkState::Disconnected).await;
        handle.shutdown().await;

        assert_eq!(script.disconnects(), 1);
    }
}

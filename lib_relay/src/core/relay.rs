//! # Relay Coordinator
//!
//! The glue between ingestion and fan-out. The broker link hands every decoded
//! record to an unbounded channel; the relay drains it and calls
//! [`SessionRegistry::broadcast`]. No buffering beyond the channel, no filtering.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::record::TelemetryRecord;
use crate::core::registry::{BroadcastReport, SessionRegistry};

/// Sending half used by the broker link.
pub type RecordSink = mpsc::UnboundedSender<TelemetryRecord>;
/// Receiving half consumed by [`Relay::run`].
pub type RecordSource = mpsc::UnboundedReceiver<TelemetryRecord>;

/// Creates the ingestion-to-relay hand-off channel.
pub fn record_channel() -> (RecordSink, RecordSource) {
    mpsc::unbounded_channel()
}

/// # Relay Stats
///
/// Lock-free counters shared by the broker link, the relay and whoever reports on
/// them (health endpoint, dataflow monitor).
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    malformed: AtomicU64,
    relayed: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
    // Unix millis of the last relayed record, 0 when none yet.
    last_record_ms: AtomicI64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Broker messages seen on the subscribed topic.
    pub received: u64,
    /// Messages dropped by the decoder.
    pub malformed: u64,
    /// Records handed to the registry.
    pub relayed: u64,
    /// Individual session sends.
    pub deliveries: u64,
    /// Sessions dropped during broadcast.
    pub evictions: u64,
    /// Receive time of the last relayed record.
    pub last_record_at: Option<DateTime<Utc>>,
}

impl RelayStats {
    /// Counts one inbound message on the topic.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one payload rejected by the decoder.
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_broadcast(&self, received_at: DateTime<Utc>, report: BroadcastReport) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.last_record_ms
            .store(received_at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Receive time of the most recent relayed record.
    pub fn last_record_at(&self) -> Option<DateTime<Utc>> {
        match self.last_record_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Reads all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            last_record_at: self.last_record_at(),
        }
    }
}

/// # Relay
///
/// Forwards each record from the broker link to every registered session.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<SessionRegistry>,
    stats: Arc<RelayStats>,
}

impl Relay {
    /// Creates a relay over `registry`, reporting into `stats`.
    pub fn new(registry: Arc<SessionRegistry>, stats: Arc<RelayStats>) -> Self {
        Self { registry, stats }
    }

    /// Broadcasts a single record.
    pub fn relay(&self, record: TelemetryRecord) -> BroadcastReport {
        let received_at = record.received_at();
        log::debug!(
            "Relaying reading received at {}: temperature={:?} humidity={:?}",
            received_at.format("%H:%M:%S%.3f"),
            record.temperature(),
            record.humidity()
        );
        let report = self.registry.broadcast(record);
        self.stats.record_broadcast(received_at, report);
        report
    }

    /// Drains `source` until every sender is dropped.
    pub async fn run(self, mut source: RecordSource) {
        log::info!("Relay started.");
        while let Some(record) = source.recv().await {
            self.relay(record);
        }
        log::info!("Relay stopped: ingestion channel closed.");
    }
}

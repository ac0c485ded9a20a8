use chrono::{DateTime, Utc};
use lib_relay::{BrokerLinkState, RelayStats, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::relay_logic::config::Settings;

#[derive(Clone)]
pub struct AppState {
    // Live viewer sessions; the relay broadcasts through the same registry
    pub registry: Arc<SessionRegistry>,
    // Counters shared with the broker link and relay
    pub stats: Arc<RelayStats>,
    // Observes the broker link lifecycle
    pub broker_state: watch::Receiver<BrokerLinkState>,
    pub session_queue: usize,
    pub send_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        stats: Arc<RelayStats>,
        broker_state: watch::Receiver<BrokerLinkState>,
        settings: &Settings,
    ) -> Self {
        Self {
            registry,
            stats,
            broker_state,
            session_queue: settings.session_queue,
            send_timeout: settings.send_timeout,
            started_at: Utc::now(),
        }
    }

    pub fn broker_state(&self) -> BrokerLinkState {
        *self.broker_state.borrow()
    }
}

use chrono::{DateTime, Utc};
use lib_relay::{BrokerLinkState, RelayStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Stale,
    Resumed,
}

/// Tracks whether readings stopped arriving while the link is subscribed.
#[derive(Debug)]
struct DataflowMonitor {
    stale_after: chrono::Duration,
    subscribed_since: Option<DateTime<Utc>>,
    warned: bool,
}

impl DataflowMonitor {
    fn new(stale_after: Duration) -> Self {
        Self {
            stale_after: chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX),
            subscribed_since: None,
            warned: false,
        }
    }

    fn check(
        &mut self,
        now: DateTime<Utc>,
        state: BrokerLinkState,
        last_record: Option<DateTime<Utc>>,
    ) -> Option<Verdict> {
        if state != BrokerLinkState::Subscribed {
            // Outages are logged by the broker link itself.
            self.subscribed_since = None;
            self.warned = false;
            return None;
        }
        let since = *self.subscribed_since.get_or_insert(now);
        let last_activity = last_record.map_or(since, |t| t.max(since));
        let stale = now - last_activity > self.stale_after;

        match (stale, self.warned) {
            (true, false) => {
                self.warned = true;
                Some(Verdict::Stale)
            }
            (false, true) => {
                self.warned = false;
                Some(Verdict::Resumed)
            }
            _ => None,
        }
    }
}

pub async fn run(
    stale_after: Duration,
    stats: Arc<RelayStats>,
    broker_state: watch::Receiver<BrokerLinkState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut monitor = DataflowMonitor::new(stale_after);
    let mut check_interval = interval((stale_after / 4).max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let state = *broker_state.borrow();
                match monitor.check(Utc::now(), state, stats.last_record_at()) {
                    Some(Verdict::Stale) => log::warn!(
                        "No telemetry for over {} seconds although the topic subscription is active.",
                        stale_after.as_secs()
                    ),
                    Some(Verdict::Resumed) => log::info!("Telemetry dataflow resumed."),
                    None => {}
                }
            }
        }
    }
}

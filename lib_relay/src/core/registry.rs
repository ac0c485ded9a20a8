//! # Session Registry
//!
//! The authoritative set of live viewer sessions and the only place records are
//! fanned out from.
//!
//! Each session is represented by the sending half of a bounded MPSC channel. The
//! receiving half belongs to the session's writer task, which does the actual network
//! I/O. `broadcast` only ever calls `try_send`, so the registry lock is never held
//! across a socket write and a slow viewer cannot stall delivery to the others.
//!
//! Records are wrapped in an `Arc` once per broadcast; every session receives a
//! pointer to the same allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::core::record::TelemetryRecord;

/// Unique identifier of a viewer session.
pub type SessionId = u64;

/// Connection handle stored by the registry: the writer task's inbox.
pub type SessionHandle = mpsc::Sender<Arc<TelemetryRecord>>;

/// Receiving half held by a session's writer task.
pub type SessionInbox = mpsc::Receiver<Arc<TelemetryRecord>>;

/// Creates the handle/inbox pair for a new session. `capacity` bounds how far a
/// viewer may fall behind before it is considered stalled.
pub fn session_channel(capacity: usize) -> (SessionHandle, SessionInbox) {
    mpsc::channel(capacity.max(1))
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The deployment's session cap is reached.
    #[error("session limit of {0} reached")]
    AtCapacity(usize),
}

/// A per-session delivery failure. Always absorbed by `broadcast`, which drops the
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionSendError {
    /// The writer task is gone; the connection has closed.
    #[error("session {0} is closed")]
    Closed(SessionId),
    /// The session's queue is full; the viewer stopped reading.
    #[error("session {0} is stalled with a full queue")]
    Stalled(SessionId),
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the record was queued for.
    pub delivered: usize,
    /// Sessions removed because their send failed.
    pub evicted: usize,
}

struct Session {
    handle: SessionHandle,
    connected_at: DateTime<Utc>,
}

/// # Session Registry
///
/// Shared between the viewer-serving activity (register/unregister) and the relay
/// (broadcast). All access goes through one mutex.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
    max_sessions: Option<usize>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SessionRegistry {
    /// Creates an empty registry. `max_sessions` is an optional deployment cap;
    /// `None` means unbounded.
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_sessions,
        }
    }

    // A panic elsewhere while holding the lock cannot leave the map half-updated:
    // every critical section is a single insert, remove or retain.
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a new session and returns its id.
    pub fn register(&self, handle: SessionHandle) -> Result<SessionId, RegistryError> {
        let mut sessions = self.lock();
        if let Some(max) = self.max_sessions {
            if sessions.len() >= max {
                log::warn!("Rejecting viewer: {} sessions already registered", max);
                return Err(RegistryError::AtCapacity(max));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            id,
            Session {
                handle,
                connected_at: Utc::now(),
            },
        );
        log::info!("Session {} registered ({} active)", id, sessions.len());
        Ok(id)
    }

    /// Removes a session. Returns false when it was already gone, which happens when
    /// both the reader and the writer of a connection report the disconnect.
    pub fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.lock();
        match sessions.remove(&id) {
            Some(session) => {
                let lifetime = Utc::now() - session.connected_at;
                log::info!(
                    "Session {} unregistered after {}s ({} active)",
                    id,
                    lifetime.num_seconds(),
                    sessions.len()
                );
                true
            }
            None => false,
        }
    }

    /// Queues `record` for every registered session.
    ///
    /// Never fails. A session whose handle is closed or whose queue is full is
    /// removed on the spot and the broadcast carries on with the rest.
    pub fn broadcast(&self, record: TelemetryRecord) -> BroadcastReport {
        let frame = Arc::new(record);
        let mut report = BroadcastReport::default();
        let mut sessions = self.lock();

        sessions.retain(|id, session| match session.handle.try_send(Arc::clone(&frame)) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(err) => {
                let err = match err {
                    TrySendError::Closed(_) => SessionSendError::Closed(*id),
                    TrySendError::Full(_) => SessionSendError::Stalled(*id),
                };
                log::info!("Dropping session: {}", err);
                report.evicted += 1;
                false
            }
        });

        report
    }

    /// Drops every session. Their writers see a closed inbox and close the sockets.
    pub fn clear(&self) -> usize {
        let mut sessions = self.lock();
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no viewer is connected.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `id` is still registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decoder::decode;

    fn reading(t: f64) -> TelemetryRecord {
        decode(format!(r#"{{"temperature":{},"humidity":28}}"#, t).as_bytes()).unwrap()
    }

    #[test]
    fn broadcast_with_no_sessions_delivers_nothing() {
        let registry = SessionRegistry::default();
        assert_eq!(registry.broadcast(reading(1.0)), BroadcastReport::default());
    }

    #[tokio::test]
    async fn every_session_receives_exactly_one_copy() {
        let registry = SessionRegistry::default();
        let mut inboxes = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = session_channel(8);
            registry.register(tx).unwrap();
            inboxes.push(rx);
        }

        let report = registry.broadcast(reading(31.1));
        assert_eq!(report, BroadcastReport { delivered: 3, evicted: 0 });

        for rx in inboxes.iter_mut() {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.temperature(), Some(31.1));
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn closed_session_is_removed_without_affecting_others() {
        let registry = SessionRegistry::default();
        let (alive_tx, mut alive_rx) = session_channel(8);
        let (dead_tx, dead_rx) = session_channel(8);
        let alive = registry.register(alive_tx).unwrap();
        let dead = registry.register(dead_tx).unwrap();
        drop(dead_rx);

        let report = registry.broadcast(reading(20.0));

        assert_eq!(report, BroadcastReport { delivered: 1, evicted: 1 });
        assert!(registry.contains(alive));
        assert!(!registry.contains(dead));
        assert!(alive_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn stalled_session_is_evicted_once_its_queue_is_full() {
        let registry = SessionRegistry::default();
        let (slow_tx, _slow_rx) = session_channel(1);
        let slow = registry.register(slow_tx).unwrap();

        assert_eq!(registry.broadcast(reading(1.0)).delivered, 1);
        let report = registry.broadcast(reading(2.0));

        assert_eq!(report.evicted, 1);
        assert!(!registry.contains(slow));
    }

    #[tokio::test]
    async fn per_session_order_follows_broadcast_order() {
        let registry = SessionRegistry::default();
        let (tx, mut rx) = session_channel(16);
        registry.register(tx).unwrap();

        for t in [1.0, 2.0, 3.0] {
            registry.broadcast(reading(t));
        }

        for expected in [1.0, 2.0, 3.0] {
            assert_eq!(rx.recv().await.unwrap().temperature(), Some(expected));
        }
    }

    #[test]
    fn unregister_twice_is_a_no_op() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = session_channel(1);
        let id = registry.register(tx).unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let registry = SessionRegistry::default();
        let (a, _ra) = session_channel(1);
        let (b, _rb) = session_channel(1);
        assert_ne!(registry.register(a).unwrap(), registry.register(b).unwrap());
    }

    #[test]
    fn cap_rejects_sessions_beyond_the_limit() {
        let registry = SessionRegistry::new(Some(1));
        let (a, _ra) = session_channel(1);
        let (b, _rb) = session_channel(1);

        let first = registry.register(a).unwrap();
        assert_eq!(registry.register(b.clone()), Err(RegistryError::AtCapacity(1)));

        registry.unregister(first);
        assert!(registry.register(b).is_ok());
    }

    #[tokio::test]
    async fn clear_closes_every_inbox() {
        let registry = SessionRegistry::default();
        let (tx, mut rx) = session_channel(1);
        registry.register(tx).unwrap();

        assert_eq!(registry.clear(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn churn_during_broadcast_never_loses_or_double_counts_sessions() {
        const BROADCASTS: usize = 200;
        const CHURN_TASKS: usize = 4;
        const CHURN_ROUNDS: usize = 200;

        let registry = Arc::new(SessionRegistry::default());
        let mut stable = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = session_channel(BROADCASTS);
            registry.register(tx).unwrap();
            stable.push(rx);
        }

        let churners: Vec<_> = (0..CHURN_TASKS)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let mut unregistered = 0;
                    for _ in 0..CHURN_ROUNDS {
                        let (tx, _rx) = session_channel(4);
                        let id = registry.register(tx).unwrap();
                        tokio::task::yield_now().await;
                        if registry.unregister(id) {
                            unregistered += 1;
                        }
                    }
                    unregistered
                })
            })
            .collect();

        let broadcaster = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut evicted = 0;
                for seq in 0..BROADCASTS {
                    let report = registry.broadcast(reading(seq as f64));
                    assert!(report.delivered >= 4, "stable session missed record {}", seq);
                    evicted += report.evicted;
                    tokio::task::yield_now().await;
                }
                evicted
            })
        };

        let mut unregistered = 0;
        for churner in churners {
            unregistered += churner.await.unwrap();
        }
        let evicted = broadcaster.await.unwrap();

        // Every churned session left exactly once, through one path or the other.
        assert_eq!(unregistered + evicted, CHURN_TASKS * CHURN_ROUNDS);
        assert_eq!(registry.len(), 4);

        for rx in stable.iter_mut() {
            for seq in 0..BROADCASTS {
                let frame = rx.try_recv().unwrap();
                assert_eq!(frame.temperature(), Some(seq as f64));
            }
            assert!(rx.try_recv().is_err());
        }
    }
}

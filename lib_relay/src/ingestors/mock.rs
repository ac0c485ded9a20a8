//! Scripted broker transport for exercising the broker link without a broker.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ingestors::transport::{BrokerTransport, ConnectionError, TransportEvent};

type Step = Result<TransportEvent, ConnectionError>;

/// Feeds events into a [`ScriptedTransport`].
#[derive(Clone)]
pub struct Script {
    tx: mpsc::UnboundedSender<Step>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    disconnects: Arc<Mutex<usize>>,
}

impl Script {
    /// Emits a successful handshake.
    pub fn connect(&self) {
        let _ = self.tx.send(Ok(TransportEvent::Connected));
    }

    /// Emits an inbound message.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(TransportEvent::Publish {
            topic: topic.to_string(),
            payload: payload.into(),
        }));
    }

    /// Emits a transport failure, as when the broker goes away.
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.tx.send(Err(ConnectionError::Transport(reason.to_string())));
    }

    /// Topics subscribed so far, one entry per subscribe call.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of times the transport was told to disconnect.
    pub fn disconnects(&self) -> usize {
        *self.disconnects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A transport that replays whatever its [`Script`] sends and otherwise waits.
pub struct ScriptedTransport {
    rx: mpsc::UnboundedReceiver<Step>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    disconnects: Arc<Mutex<usize>>,
}

impl ScriptedTransport {
    /// Creates the transport and the handle that drives it.
    pub fn new() -> (Self, Script) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let disconnects = Arc::new(Mutex::new(0));
        let script = Script {
            tx,
            subscriptions: subscriptions.clone(),
            disconnects: disconnects.clone(),
        };
        (
            Self {
                rx,
                subscriptions,
                disconnects,
            },
            script,
        )
    }
}

impl BrokerTransport for ScriptedTransport {
    async fn next_event(&mut self) -> Result<TransportEvent, ConnectionError> {
        match self.rx.recv().await {
            Some(step) => step,
            None => std::future::pending().await,
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) {
        *self.disconnects.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

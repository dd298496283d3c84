use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("broker {0} is disconnected")]
    Disconnected(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// A publish/subscribe broker connection.
///
/// Several brokers may be connected at once; callers treat them as redundant
/// paths to the same set of subscribers, not as separate audiences.
pub trait Bus: Send + Sync {
    /// Stable identifier used in logs and delivery bookkeeping.
    fn id(&self) -> &str;
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// In-memory broker for tests, demos and single-process rooms.
///
/// Every `LocalBus` is an independent broker: publishing on one never reaches
/// subscribers of another. `set_connected(false)` simulates an outage, during
/// which publishes fail and nothing is delivered.
#[derive(Debug)]
pub struct LocalBus {
    id: String,
    connected: AtomicBool,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::named("local")
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: AtomicBool::new(true),
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::Disconnected(self.id.clone()));
        }
        let sender = self.sender_for(topic);
        // A topic nobody listens to is not a broker failure.
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

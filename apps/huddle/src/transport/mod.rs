use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transport_bus::Bus;

use crate::config::MeshConfig;
use crate::protocol::{Envelope, PROTOCOL_VERSION, Payload, unix_millis};

pub mod mock;
pub mod rtc;
pub mod webrtc;

use self::mock::MockConnectionFactory;
use self::rtc::ConnectionFactory;
use self::webrtc::WebRtcConnectionFactory;

/// Peer connection implementation a host wires into `MeshCollaborators`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// In-memory connections; no media leaves the process.
    #[default]
    Mock,
    /// Real peer connections using the configured ICE servers.
    WebRtc,
}

pub fn connection_factory(
    backend: Backend,
    label: &str,
    config: &MeshConfig,
) -> Arc<dyn ConnectionFactory> {
    match backend {
        Backend::Mock => Arc::new(MockConnectionFactory::new(label)),
        Backend::WebRtc => Arc::new(WebRtcConnectionFactory::from_config(config)),
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no brokers configured")]
    NoBrokers,
    #[error("no broker accepted the publish")]
    AllBrokersDown,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of fanning one envelope out over the broker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub accepted: usize,
    pub attempted: usize,
}

#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub broker: String,
    pub payload: Bytes,
}

/// Stamps outgoing envelopes and publishes identical copies on every broker.
///
/// The brokers are redundant paths to the same room; a copy lost on one broker
/// is expected to arrive through another, and the receiver's dedup window drops
/// the extras.
pub struct BrokerSet {
    brokers: Vec<Arc<dyn Bus>>,
    topic: String,
    local_id: String,
    session_id: u32,
    next_seq: AtomicU64,
}

impl BrokerSet {
    pub fn new(
        brokers: Vec<Arc<dyn Bus>>,
        topic: impl Into<String>,
        local_id: impl Into<String>,
        session_id: u32,
    ) -> Result<Self, TransportError> {
        if brokers.is_empty() {
            return Err(TransportError::NoBrokers);
        }
        Ok(Self {
            brokers,
            topic: topic.into(),
            local_id: local_id.into(),
            session_id,
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn connected_count(&self) -> usize {
        self.brokers.iter().filter(|bus| bus.is_connected()).count()
    }

    pub fn stamp(&self, to: Option<&str>, payload: Payload) -> Envelope {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        Envelope {
            version: PROTOCOL_VERSION,
            from: self.local_id.clone(),
            to: to.map(str::to_string),
            session_id: self.session_id,
            msg_id: format!("{:08x}-{seq}", self.session_id),
            ts: Some(unix_millis()),
            payload,
        }
    }

    pub fn send(&self, to: Option<&str>, payload: Payload) -> Result<Delivery, TransportError> {
        let envelope = self.stamp(to, payload);
        self.publish(&envelope)
    }

    pub fn publish(&self, envelope: &Envelope) -> Result<Delivery, TransportError> {
        let bytes = envelope.encode()?;
        let mut accepted = 0;
        for bus in &self.brokers {
            if !bus.is_connected() {
                trace!(
                    target = "transport",
                    broker = bus.id(),
                    "skipping disconnected broker"
                );
                continue;
            }
            match bus.publish(&self.topic, bytes.clone()) {
                Ok(()) => accepted += 1,
                Err(err) => {
                    debug!(
                        target = "transport",
                        broker = bus.id(),
                        error = %err,
                        "broker publish failed"
                    );
                }
            }
        }
        trace!(
            target = "transport",
            kind = envelope.payload.kind(),
            msg_id = %envelope.msg_id,
            accepted,
            "envelope published"
        );
        if accepted == 0 {
            return Err(TransportError::AllBrokersDown);
        }
        Ok(Delivery {
            accepted,
            attempted: self.brokers.len(),
        })
    }

    /// Subscribes to the room topic on every broker and forwards raw frames.
    ///
    /// Subscriptions are taken before this returns, so nothing published after
    /// the call is missed.
    pub fn spawn_pumps(&self, inbound: mpsc::UnboundedSender<InboundFrame>) -> Vec<JoinHandle<()>> {
        self.brokers
            .iter()
            .map(|bus| {
                let mut rx = bus.subscribe(&self.topic);
                let broker = bus.id().to_string();
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(message) => {
                                let frame = InboundFrame {
                                    broker: broker.clone(),
                                    payload: message.payload,
                                };
                                if inbound.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(
                                    target = "transport",
                                    broker = %broker,
                                    skipped,
                                    "broker receiver lagged"
                                );
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                warn!(target = "transport", broker = %broker, "broker subscription closed");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

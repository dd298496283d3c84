use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::negotiation::{NegotiationInput, NegotiationPhase};
use crate::protocol::MediaState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySample {
    pub rtt_ms: f64,
    pub packet_loss: f64,
}

impl QualitySample {
    pub fn new(rtt_ms: f64, packet_loss: f64) -> Self {
        let packet_loss = if packet_loss.is_nan() {
            0.0
        } else {
            packet_loss.clamp(0.0, 1.0)
        };
        Self {
            rtt_ms: rtt_ms.max(0.0),
            packet_loss,
        }
    }
}

/// Handle to the negotiation task that owns this peer's connection object.
#[derive(Debug)]
pub struct PeerLink {
    pub id: u64,
    pub inputs: mpsc::UnboundedSender<NegotiationInput>,
    pub task: JoinHandle<()>,
}

impl PeerLink {
    pub fn send(&self, input: NegotiationInput) -> bool {
        self.inputs.send(input).is_ok()
    }
}

#[derive(Debug)]
pub struct Peer {
    pub peer_id: String,
    pub name: String,
    pub platform: String,
    pub session_id: u32,
    pub phase: NegotiationPhase,
    pub media: MediaState,
    pub quality: Option<QualitySample>,
    pub joined_at: Instant,
    pub last_seen: Instant,
    pub last_ping: Option<Instant>,
    pub link: Option<PeerLink>,
}

impl Peer {
    pub fn new(
        peer_id: impl Into<String>,
        name: impl Into<String>,
        platform: impl Into<String>,
        session_id: u32,
        now: Instant,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            platform: platform.into(),
            session_id,
            phase: NegotiationPhase::Idle,
            media: MediaState::default(),
            quality: None,
            joined_at: now,
            last_seen: now,
            last_ping: None,
            link: None,
        }
    }

    pub fn link_id(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.id)
    }

    /// Drops the negotiation input channel; the task closes the connection
    /// object and exits. Returns the task so callers may await it.
    pub fn release(&mut self) -> Option<JoinHandle<()>> {
        self.link.take().map(|link| link.task)
    }

    pub fn snapshot(&self, now: Instant) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
            platform: self.platform.clone(),
            phase: self.phase,
            media: self.media,
            quality: self.quality,
            last_seen_ms_ago: millis_since(now, self.last_seen),
            last_ping_ms_ago: self.last_ping.map(|at| millis_since(now, at)),
        }
    }
}

fn millis_since(now: Instant, then: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(then).as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub name: String,
    pub platform: String,
    pub phase: NegotiationPhase,
    pub media: MediaState,
    pub quality: Option<QualitySample>,
    pub last_seen_ms_ago: u64,
    pub last_ping_ms_ago: Option<u64>,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    pub fn insert(&mut self, peer: Peer) -> Option<Peer> {
        self.peers.insert(peer.peer_id.clone(), peer)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        self.peers.remove(peer_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn display_name(&self, peer_id: &str) -> Option<&str> {
        self.peers.get(peer_id).map(|peer| peer.name.as_str())
    }

    /// Records traffic from `peer_id`. Returns `false` for unknown peers.
    pub fn touch(&mut self, peer_id: &str, now: Instant, ping: bool) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = now;
                if ping {
                    peer.last_ping = Some(now);
                }
                true
            }
            None => false,
        }
    }

    /// Peers not heard from for at least `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.peers
            .values()
            .filter(|peer| now.saturating_duration_since(peer.last_seen) >= timeout)
            .map(|peer| peer.peer_id.clone())
            .collect()
    }

    pub fn snapshots(&self, now: Instant) -> Vec<PeerSnapshot> {
        self.peers.values().map(|peer| peer.snapshot(now)).collect()
    }

    pub fn drain(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.peers).into_values().collect()
    }
}

//! Typed notifications delivered to the embedding application.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::MediaState;
use crate::session::negotiation::NegotiationPhase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// The peer sent `leave`.
    Left,
    /// Nothing heard from the peer within the peer timeout.
    Timeout,
    NegotiationFailed(String),
    /// The same peer id rejoined with a new session.
    SessionReplaced,
    /// The local peer left the room.
    LocalShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMicRole {
    /// Local outgoing audio is routed exclusively to the counterpart.
    Source,
    /// The counterpart routes its audio exclusively to us.
    Target,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaisedHandEntry {
    pub peer_id: String,
    pub name: String,
    pub raised_at: u64,
    pub is_local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MeshEvent {
    PeerJoined {
        peer_id: String,
        name: String,
        platform: String,
    },
    PeerLeft {
        peer_id: String,
        reason: LeaveReason,
    },
    PeerPhaseChanged {
        peer_id: String,
        phase: NegotiationPhase,
    },
    PeerMediaChanged {
        peer_id: String,
        media: MediaState,
    },
    LocalMediaChanged {
        media: MediaState,
    },
    TransportDown,
    TransportRestored,
    RoomLockChanged {
        locked: bool,
        owner: Option<String>,
    },
    RoomLockedNotice {
        owner: String,
        ts: u64,
    },
    MuteAllRequested {
        request_id: String,
        requested_by: String,
        requested_by_name: String,
    },
    MuteAllAccepted {
        request_id: String,
        peer_id: String,
    },
    MuteAllDeclined {
        request_id: String,
        peer_id: String,
    },
    RaisedHandsChanged {
        queue: Vec<RaisedHandEntry>,
    },
    RemoteMicRequested {
        request_id: String,
        source_peer_id: String,
        source_name: String,
    },
    RemoteMicAccepted {
        request_id: String,
        target_peer_id: String,
    },
    RemoteMicDeclined {
        request_id: String,
        target_peer_id: String,
        reason: Option<String>,
    },
    RemoteMicLive {
        request_id: String,
        peer_id: String,
        role: RemoteMicRole,
    },
    RemoteMicStopped {
        request_id: String,
        peer_id: String,
        reason: String,
    },
}

pub trait EventSink: Send + Sync {
    fn handle(&self, event: MeshEvent);
}

impl EventSink for mpsc::UnboundedSender<MeshEvent> {
    fn handle(&self, event: MeshEvent) {
        let _ = self.send(event);
    }
}


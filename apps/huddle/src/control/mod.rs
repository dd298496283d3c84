//! Room-level control state replicated over the signaling channel.
//!
//! Handlers here never touch the transport, the registry or the audio
//! pipeline directly. Each returns a list of `ControlEffect`s that the dispatch
//! loop carries out in order, which keeps the protocol logic synchronous and
//! testable on its own.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::audio::RoutingMode;
use crate::events::{MeshEvent, RaisedHandEntry};
use crate::protocol::Payload;

pub mod moderation;
pub mod remote_mic;

/// Mute-all request ids this peer issued that a response may still refer to.
const ISSUED_MUTE_ALL_MEMORY: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("a remote mic request or session is already in progress")]
    RemoteMicBusy,
    #[error("cannot request the remote mic of the local peer")]
    RemoteMicSelfTarget,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("no pending remote mic request {0}")]
    UnknownRemoteMicRequest(String),
    #[error("no remote mic session to stop")]
    RemoteMicIdle,
    #[error("no pending mute-all request {0}")]
    UnknownMuteAllRequest(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEffect {
    Broadcast(Payload),
    SendTo(String, Payload),
    Emit(MeshEvent),
    SetRouting(RoutingMode),
    /// Mute the local microphone and advertise the new media state.
    MuteLocalMic,
    /// The raised-hands queue changed; the dispatcher resolves display names.
    RaisedHandsChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked { owner: String, since: u64 },
}

impl LockState {
    pub fn owner(&self) -> Option<&str> {
        match self {
            LockState::Unlocked => None,
            LockState::Locked { owner, .. } => Some(owner),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked { .. })
    }
}

/// The at-most-one remote mic session seen from the local side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteMicSlot {
    Idle,
    /// Sent `rm_request`, waiting for `rm_response`.
    Requesting { request_id: String, target: String },
    /// Local audio is routed exclusively to `target`.
    Source {
        request_id: String,
        target: String,
        live: bool,
    },
    /// Accepted a request; `source` routes its audio to us.
    Target { request_id: String, source: String },
}

impl RemoteMicSlot {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            RemoteMicSlot::Idle => None,
            RemoteMicSlot::Requesting { request_id, .. }
            | RemoteMicSlot::Source { request_id, .. }
            | RemoteMicSlot::Target { request_id, .. } => Some(request_id),
        }
    }

    /// The other peer of the request or session.
    pub fn counterpart(&self) -> Option<&str> {
        match self {
            RemoteMicSlot::Idle => None,
            RemoteMicSlot::Requesting { target, .. } | RemoteMicSlot::Source { target, .. } => {
                Some(target)
            }
            RemoteMicSlot::Target { source, .. } => Some(source),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RemoteMicSlot::Source { .. } | RemoteMicSlot::Target { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRemoteMic {
    pub source: String,
    pub source_name: String,
}

#[derive(Debug)]
pub struct ControlState {
    local_id: String,
    local_name: String,
    lock: LockState,
    raised_hands: HashMap<String, u64>,
    pending_mute_all: HashMap<String, String>,
    issued_mute_all: VecDeque<String>,
    pending_remote_mic: HashMap<String, PendingRemoteMic>,
    remote_mic: RemoteMicSlot,
    remote_mic_last_heard: Option<Instant>,
}

impl ControlState {
    pub fn new(local_id: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            local_name: local_name.into(),
            lock: LockState::Unlocked,
            raised_hands: HashMap::new(),
            pending_mute_all: HashMap::new(),
            issued_mute_all: VecDeque::new(),
            pending_remote_mic: HashMap::new(),
            remote_mic: RemoteMicSlot::Idle,
            remote_mic_last_heard: None,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn lock(&self) -> &LockState {
        &self.lock
    }

    pub fn remote_mic(&self) -> &RemoteMicSlot {
        &self.remote_mic
    }

    pub fn local_hand_raised(&self) -> bool {
        self.raised_hands.contains_key(&self.local_id)
    }

    pub fn pending_mute_all(&self) -> &HashMap<String, String> {
        &self.pending_mute_all
    }

    pub fn pending_remote_mic(&self) -> &HashMap<String, PendingRemoteMic> {
        &self.pending_remote_mic
    }

    /// Raised hands sorted by `raisedAt`, peer id breaking ties.
    pub fn raised_hands_queue<F>(&self, names: F) -> Vec<RaisedHandEntry>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut queue: Vec<RaisedHandEntry> = self
            .raised_hands
            .iter()
            .map(|(peer_id, raised_at)| {
                let is_local = *peer_id == self.local_id;
                let name = if is_local {
                    format!("{} (you)", self.local_name)
                } else {
                    names(peer_id).unwrap_or_else(|| peer_id.clone())
                };
                RaisedHandEntry {
                    peer_id: peer_id.clone(),
                    name,
                    raised_at: *raised_at,
                    is_local,
                }
            })
            .collect();
        queue.sort_by(|a, b| {
            a.raised_at
                .cmp(&b.raised_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        queue
    }

    /// Cleanup when `peer_id` leaves for any reason.
    pub fn on_peer_left(&mut self, peer_id: &str, ts: u64) -> Vec<ControlEffect> {
        let mut effects = self.moderation_peer_left(peer_id, ts);
        effects.extend(self.remote_mic_peer_left(peer_id));
        effects
    }

    pub fn snapshot<F>(&self, names: F) -> ControlSnapshot
    where
        F: Fn(&str) -> Option<String>,
    {
        let (target, source) = match &self.remote_mic {
            RemoteMicSlot::Source { target, .. } => (Some(target.clone()), None),
            RemoteMicSlot::Target { source, .. } => (None, Some(source.clone())),
            RemoteMicSlot::Idle | RemoteMicSlot::Requesting { .. } => (None, None),
        };
        let pending_outgoing = match &self.remote_mic {
            RemoteMicSlot::Requesting { request_id, .. } => Some(request_id.clone()),
            _ => None,
        };
        let active_request = if self.remote_mic.is_active() {
            self.remote_mic.request_id().map(str::to_string)
        } else {
            None
        };
        ControlSnapshot {
            room_locked: self.lock.is_locked(),
            room_lock_owner_peer_id: self.lock.owner().map(str::to_string),
            local_hand_raised: self.local_hand_raised(),
            raised_hands: self.raised_hands_queue(names),
            pending_mute_all_requests: self
                .pending_mute_all
                .iter()
                .map(|(id, peer)| (id.clone(), peer.clone()))
                .collect(),
            pending_remote_mic_requests: self
                .pending_remote_mic
                .iter()
                .map(|(id, pending)| (id.clone(), pending.source.clone()))
                .collect(),
            pending_outgoing_remote_mic_request_id: pending_outgoing,
            active_remote_mic_target_peer_id: target,
            active_remote_mic_source_peer_id: source,
            active_remote_mic_request_id: active_request,
            remote_mic_live: matches!(
                self.remote_mic,
                RemoteMicSlot::Source { live: true, .. } | RemoteMicSlot::Target { .. }
            ),
        }
    }

    fn remember_issued_mute_all(&mut self, request_id: String) {
        if self.issued_mute_all.len() == ISSUED_MUTE_ALL_MEMORY {
            self.issued_mute_all.pop_front();
        }
        self.issued_mute_all.push_back(request_id);
    }

    fn issued_mute_all(&self, request_id: &str) -> bool {
        self.issued_mute_all.iter().any(|id| id == request_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSnapshot {
    pub room_locked: bool,
    pub room_lock_owner_peer_id: Option<String>,
    pub local_hand_raised: bool,
    pub raised_hands: Vec<RaisedHandEntry>,
    pub pending_mute_all_requests: BTreeMap<String, String>,
    pub pending_remote_mic_requests: BTreeMap<String, String>,
    pub pending_outgoing_remote_mic_request_id: Option<String>,
    pub active_remote_mic_target_peer_id: Option<String>,
    pub active_remote_mic_source_peer_id: Option<String>,
    pub active_remote_mic_request_id: Option<String>,
    pub remote_mic_live: bool,
}

pub(crate) fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_hands_queue_is_ordered_and_annotated() {
        let mut state = ControlState::new("me", "Mia");
        state.raised_hands.insert("zed".into(), 10);
        state.raised_hands.insert("me".into(), 20);
        state.raised_hands.insert("amy".into(), 10);

        let queue = state.raised_hands_queue(|id| match id {
            "zed" => Some("Zed".into()),
            _ => None,
        });
        let order: Vec<_> = queue.iter().map(|e| e.peer_id.as_str()).collect();
        assert_eq!(order, vec!["amy", "zed", "me"]);
        assert_eq!(queue[0].name, "amy");
        assert_eq!(queue[1].name, "Zed");
        assert_eq!(queue[2].name, "Mia (you)");
        assert!(queue[2].is_local);
    }

    #[test]
    fn snapshot_reflects_lock_and_remote_mic_slot() {
        let mut state = ControlState::new("me", "Mia");
        state.lock = LockState::Locked {
            owner: "host".into(),
            since: 1,
        };
        state.remote_mic = RemoteMicSlot::Source {
            request_id: "r1".into(),
            target: "y".into(),
            live: false,
        };
        let snap = state.snapshot(|_| None);
        assert!(snap.room_locked);
        assert_eq!(snap.room_lock_owner_peer_id.as_deref(), Some("host"));
        assert_eq!(snap.active_remote_mic_target_peer_id.as_deref(), Some("y"));
        assert_eq!(snap.active_remote_mic_request_id.as_deref(), Some("r1"));
        assert!(snap.active_remote_mic_source_peer_id.is_none());
        assert!(snap.pending_outgoing_remote_mic_request_id.is_none());
        assert!(!snap.remote_mic_live);
    }

    #[test]
    fn issued_mute_all_memory_is_bounded() {
        let mut state = ControlState::new("me", "Mia");
        for n in 0..(ISSUED_MUTE_ALL_MEMORY + 5) {
            state.remember_issued_mute_all(format!("req-{n}"));
        }
        assert!(!state.issued_mute_all("req-0"));
        assert!(state.issued_mute_all(&format!("req-{}", ISSUED_MUTE_ALL_MEMORY + 4)));
    }
}

//! Room lock, mute-all and hand-raise.
//!
//! Room lock is last-writer-wins per receiver: `ts` is carried along but never
//! used to order concurrent writes, so two peers toggling at once may briefly
//! disagree until the next lock message.

use tracing::{debug, trace};

use super::{ControlEffect, ControlError, ControlState, LockState, new_request_id};
use crate::events::MeshEvent;
use crate::protocol::{
    HandRaise, MuteAllRequest, MuteAllResponse, Payload, RoomLock, RoomLockedNotice,
};

impl ControlState {
    pub fn toggle_room_lock(&mut self, ts: u64) -> Vec<ControlEffect> {
        let locked = !self.lock.is_locked();
        self.set_room_lock(locked, ts)
    }

    pub fn set_room_lock(&mut self, locked: bool, ts: u64) -> Vec<ControlEffect> {
        let message = RoomLock {
            locked,
            locked_by_peer_id: self.local_id.clone(),
            ts,
        };
        let mut effects = vec![ControlEffect::Broadcast(Payload::RoomLock(message.clone()))];
        effects.extend(self.apply_room_lock(message));
        effects
    }

    pub fn on_room_lock(&mut self, from: &str, mut message: RoomLock) -> Vec<ControlEffect> {
        if message.locked_by_peer_id.is_empty() {
            message.locked_by_peer_id = from.to_string();
        }
        trace!(
            target = "control",
            peer_id = %from,
            locked = message.locked,
            owner = %message.locked_by_peer_id,
            "room lock received"
        );
        self.apply_room_lock(message)
    }

    fn apply_room_lock(&mut self, message: RoomLock) -> Vec<ControlEffect> {
        let next = if message.locked {
            LockState::Locked {
                owner: message.locked_by_peer_id,
                since: message.ts,
            }
        } else {
            LockState::Unlocked
        };
        self.replace_lock(next)
    }

    fn replace_lock(&mut self, next: LockState) -> Vec<ControlEffect> {
        let changed = self.lock.is_locked() != next.is_locked() || self.lock.owner() != next.owner();
        self.lock = next;
        if !changed {
            return Vec::new();
        }
        debug!(target = "control", locked = self.lock.is_locked(), owner = ?self.lock.owner(), "room lock changed");
        vec![ControlEffect::Emit(MeshEvent::RoomLockChanged {
            locked: self.lock.is_locked(),
            owner: self.lock.owner().map(str::to_string),
        })]
    }

    /// `now` stands in for a notice that arrives without a timestamp.
    pub fn on_room_locked_notice(
        &mut self,
        from: &str,
        notice: RoomLockedNotice,
        now: u64,
    ) -> Vec<ControlEffect> {
        let owner = if notice.locked_by_peer_id.is_empty() {
            from.to_string()
        } else {
            notice.locked_by_peer_id
        };
        let ts = notice.ts.unwrap_or(now);
        let mut effects = vec![ControlEffect::Emit(MeshEvent::RoomLockedNotice {
            owner: owner.clone(),
            ts,
        })];
        effects.extend(self.replace_lock(LockState::Locked { owner, since: ts }));
        effects
    }

    /// Brings a newly joined peer up to date with what this peer owns.
    pub fn on_peer_joined(&self, peer_id: &str) -> Vec<ControlEffect> {
        let mut effects = Vec::new();
        if let LockState::Locked { owner, since } = &self.lock {
            if *owner == self.local_id {
                effects.push(ControlEffect::SendTo(
                    peer_id.to_string(),
                    Payload::RoomLockedNotice(RoomLockedNotice {
                        locked_by_peer_id: owner.clone(),
                        ts: Some(*since),
                    }),
                ));
            }
        }
        if let Some(raised_at) = self.raised_hands.get(&self.local_id) {
            effects.push(ControlEffect::SendTo(
                peer_id.to_string(),
                Payload::HandRaise(HandRaise {
                    peer_id: self.local_id.clone(),
                    raised: true,
                    ts: *raised_at,
                }),
            ));
        }
        effects
    }

    /// Asks every peer to mute. Returns the new request id.
    pub fn request_mute_all(&mut self, ts: u64) -> (String, Vec<ControlEffect>) {
        let request_id = new_request_id();
        self.remember_issued_mute_all(request_id.clone());
        let effects = vec![ControlEffect::Broadcast(Payload::MuteAllRequest(
            MuteAllRequest {
                request_id: request_id.clone(),
                requested_by_peer_id: self.local_id.clone(),
                requested_by_name: self.local_name.clone(),
                ts,
            },
        ))];
        (request_id, effects)
    }

    pub fn on_mute_all_request(&mut self, from: &str, request: MuteAllRequest) -> Vec<ControlEffect> {
        if self.pending_mute_all.contains_key(&request.request_id) {
            return Vec::new();
        }
        self.pending_mute_all
            .insert(request.request_id.clone(), from.to_string());
        vec![ControlEffect::Emit(MeshEvent::MuteAllRequested {
            request_id: request.request_id,
            requested_by: from.to_string(),
            requested_by_name: request.requested_by_name,
        })]
    }

    pub fn respond_mute_all(
        &mut self,
        request_id: &str,
        accepted: bool,
        ts: u64,
    ) -> Result<Vec<ControlEffect>, ControlError> {
        let requester = self
            .pending_mute_all
            .remove(request_id)
            .ok_or_else(|| ControlError::UnknownMuteAllRequest(request_id.to_string()))?;
        let mut effects = vec![ControlEffect::SendTo(
            requester,
            Payload::MuteAllResponse(MuteAllResponse {
                request_id: request_id.to_string(),
                accepted,
                ts,
            }),
        )];
        if accepted {
            effects.push(ControlEffect::MuteLocalMic);
        }
        Ok(effects)
    }

    pub fn on_mute_all_response(&mut self, from: &str, response: MuteAllResponse) -> Vec<ControlEffect> {
        if !self.issued_mute_all(&response.request_id) {
            debug!(
                target = "control",
                peer_id = %from,
                request_id = %response.request_id,
                "ignoring mute-all response to a request we did not issue"
            );
            return Vec::new();
        }
        let event = if response.accepted {
            MeshEvent::MuteAllAccepted {
                request_id: response.request_id,
                peer_id: from.to_string(),
            }
        } else {
            MeshEvent::MuteAllDeclined {
                request_id: response.request_id,
                peer_id: from.to_string(),
            }
        };
        vec![ControlEffect::Emit(event)]
    }

    pub fn toggle_hand_raise(&mut self, ts: u64) -> Vec<ControlEffect> {
        let raised = !self.local_hand_raised();
        self.set_hand_raised(raised, ts)
    }

    pub fn set_hand_raised(&mut self, raised: bool, ts: u64) -> Vec<ControlEffect> {
        if raised == self.local_hand_raised() {
            return Vec::new();
        }
        let local_id = self.local_id.clone();
        self.apply_hand(&local_id, raised, ts);
        vec![
            ControlEffect::Broadcast(Payload::HandRaise(HandRaise {
                peer_id: local_id,
                raised,
                ts,
            })),
            ControlEffect::RaisedHandsChanged,
        ]
    }

    /// Keyed by the envelope sender; the body's `peerId` is informational.
    pub fn on_hand_raise(&mut self, from: &str, message: HandRaise) -> Vec<ControlEffect> {
        if self.apply_hand(from, message.raised, message.ts) {
            vec![ControlEffect::RaisedHandsChanged]
        } else {
            Vec::new()
        }
    }

    fn apply_hand(&mut self, peer_id: &str, raised: bool, ts: u64) -> bool {
        if raised {
            if self.raised_hands.contains_key(peer_id) {
                return false;
            }
            self.raised_hands.insert(peer_id.to_string(), ts);
            true
        } else {
            self.raised_hands.remove(peer_id).is_some()
        }
    }

    pub(super) fn moderation_peer_left(&mut self, peer_id: &str, ts: u64) -> Vec<ControlEffect> {
        let mut effects = Vec::new();
        if self.raised_hands.remove(peer_id).is_some() {
            effects.push(ControlEffect::RaisedHandsChanged);
        }
        self.pending_mute_all
            .retain(|_, requester| requester != peer_id);

        if self.lock.owner() == Some(peer_id) {
            debug!(target = "control", peer_id = %peer_id, "lock owner left; clearing room lock");
            effects.push(ControlEffect::Broadcast(Payload::RoomLock(RoomLock {
                locked: false,
                locked_by_peer_id: self.local_id.clone(),
                ts,
            })));
            effects.extend(self.replace_lock(LockState::Unlocked));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(effects: &[ControlEffect]) -> Vec<&MeshEvent> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                ControlEffect::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn toggle_lock_broadcasts_and_records_owner() {
        let mut host = ControlState::new("host", "Host");
        let effects = host.toggle_room_lock(100);
        assert!(matches!(
            &effects[0],
            ControlEffect::Broadcast(Payload::RoomLock(RoomLock { locked: true, locked_by_peer_id, .. }))
                if locked_by_peer_id == "host"
        ));
        assert_eq!(host.lock().owner(), Some("host"));

        host.toggle_room_lock(200);
        assert_eq!(*host.lock(), LockState::Unlocked);
    }

    #[test]
    fn room_lock_is_last_writer_wins() {
        let mut peer = ControlState::new("p", "P");
        peer.on_room_lock(
            "x",
            RoomLock {
                locked: true,
                locked_by_peer_id: "x".into(),
                ts: 500,
            },
        );
        // An older timestamp still wins because it arrived last.
        peer.on_room_lock(
            "y",
            RoomLock {
                locked: true,
                locked_by_peer_id: "y".into(),
                ts: 100,
            },
        );
        assert_eq!(peer.lock().owner(), Some("y"));
        let effects = peer.on_room_lock(
            "y",
            RoomLock {
                locked: true,
                locked_by_peer_id: "y".into(),
                ts: 100,
            },
        );
        assert!(effects.is_empty(), "no change means no event");
    }

    #[test]
    fn owner_sends_notice_to_new_peer_and_notice_synthesizes_ts() {
        let mut host = ControlState::new("host", "Host");
        host.toggle_room_lock(42);
        let effects = host.on_peer_joined("late");
        let Some(ControlEffect::SendTo(to, Payload::RoomLockedNotice(notice))) = effects.first()
        else {
            panic!("expected notice, got {effects:?}");
        };
        assert_eq!(to, "late");
        assert_eq!(notice.locked_by_peer_id, "host");

        let mut late = ControlState::new("late", "Late");
        let effects = late.on_room_locked_notice(
            "host",
            RoomLockedNotice {
                locked_by_peer_id: "host".into(),
                ts: None,
            },
            9_999,
        );
        assert!(matches!(
            emitted(&effects)[0],
            MeshEvent::RoomLockedNotice { owner, ts: 9_999 } if owner == "host"
        ));
        assert_eq!(late.lock().owner(), Some("host"));
    }

    #[test]
    fn non_owner_sends_no_notice() {
        let mut peer = ControlState::new("p", "P");
        peer.on_room_lock(
            "host",
            RoomLock {
                locked: true,
                locked_by_peer_id: "host".into(),
                ts: 1,
            },
        );
        assert!(peer.on_peer_joined("late").is_empty());
    }

    #[test]
    fn owner_departure_clears_lock() {
        let mut peer = ControlState::new("p", "P");
        peer.on_room_lock(
            "host",
            RoomLock {
                locked: true,
                locked_by_peer_id: "host".into(),
                ts: 1,
            },
        );
        let effects = peer.on_peer_left("host", 50);
        assert!(!peer.lock().is_locked());
        assert!(effects.iter().any(|effect| matches!(
            effect,
            ControlEffect::Broadcast(Payload::RoomLock(RoomLock { locked: false, .. }))
        )));
        assert!(matches!(
            emitted(&effects)[0],
            MeshEvent::RoomLockChanged { locked: false, owner: None }
        ));
    }

    #[test]
    fn mute_all_response_only_counts_for_own_requests() {
        let mut requester = ControlState::new("r", "R");
        let (request_id, _) = requester.request_mute_all(1);

        let foreign = requester.on_mute_all_response(
            "x",
            MuteAllResponse {
                request_id: "someone-else".into(),
                accepted: true,
                ts: 2,
            },
        );
        assert!(foreign.is_empty());

        let ours = requester.on_mute_all_response(
            "x",
            MuteAllResponse {
                request_id: request_id.clone(),
                accepted: true,
                ts: 2,
            },
        );
        assert!(matches!(
            emitted(&ours)[0],
            MeshEvent::MuteAllAccepted { request_id: id, peer_id } if *id == request_id && peer_id == "x"
        ));
    }

    #[test]
    fn accepting_mute_all_mutes_locally_and_replies() {
        let mut peer = ControlState::new("p", "P");
        peer.on_mute_all_request(
            "r",
            MuteAllRequest {
                request_id: "req".into(),
                requested_by_peer_id: "r".into(),
                requested_by_name: "R".into(),
                ts: 1,
            },
        );
        assert_eq!(peer.pending_mute_all().get("req").map(String::as_str), Some("r"));

        let effects = peer.respond_mute_all("req", true, 2).expect("pending");
        assert!(matches!(
            &effects[0],
            ControlEffect::SendTo(to, Payload::MuteAllResponse(MuteAllResponse { accepted: true, .. })) if to == "r"
        ));
        assert!(effects.contains(&ControlEffect::MuteLocalMic));
        assert!(peer.pending_mute_all().is_empty());
        assert_eq!(
            peer.respond_mute_all("req", true, 3),
            Err(ControlError::UnknownMuteAllRequest("req".into()))
        );
    }

    #[test]
    fn requester_departure_drops_its_mute_all_request() {
        let mut peer = ControlState::new("p", "P");
        peer.on_mute_all_request(
            "r",
            MuteAllRequest {
                request_id: "req".into(),
                requested_by_peer_id: "r".into(),
                requested_by_name: "R".into(),
                ts: 1,
            },
        );
        peer.on_peer_left("r", 5);
        assert!(peer.pending_mute_all().is_empty());
    }

    #[test]
    fn hand_raise_round_trip_and_replay() {
        let mut me = ControlState::new("me", "Me");
        let effects = me.toggle_hand_raise(10);
        assert!(effects.contains(&ControlEffect::RaisedHandsChanged));
        assert!(me.local_hand_raised());
        assert!(me.set_hand_raised(true, 11).is_empty());

        let replay = me.on_peer_joined("new");
        assert!(matches!(
            &replay[0],
            ControlEffect::SendTo(to, Payload::HandRaise(HandRaise { raised: true, ts: 10, .. })) if to == "new"
        ));

        let mut other = ControlState::new("o", "O");
        other.on_hand_raise(
            "me",
            HandRaise {
                peer_id: "me".into(),
                raised: true,
                ts: 10,
            },
        );
        assert_eq!(other.raised_hands_queue(|_| None).len(), 1);
        let effects = other.on_peer_left("me", 20);
        assert_eq!(effects, vec![ControlEffect::RaisedHandsChanged]);
        assert!(other.raised_hands_queue(|_| None).is_empty());
    }
}

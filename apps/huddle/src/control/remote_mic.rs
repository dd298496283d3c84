//! Remote mic: one peer temporarily routes its outgoing audio to a single
//! other peer instead of the whole room.
//!
//! The requester becomes the source once the target accepts. The target sends
//! `rm_response` followed by `rm_start`; both sides then heartbeat until either
//! one stops or goes quiet.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    ControlEffect, ControlError, ControlState, PendingRemoteMic, RemoteMicSlot, new_request_id,
};
use crate::audio::RoutingMode;
use crate::events::{MeshEvent, RemoteMicRole};
use crate::protocol::{
    Payload, RemoteMicRequest, RemoteMicResponse, RemoteMicSignal, RemoteMicStop,
};

pub const REASON_BUSY: &str = "busy";
pub const REASON_DECLINED: &str = "declined";
pub const REASON_STOPPED: &str = "stopped";
pub const REASON_LEFT: &str = "left";
pub const REASON_PEER_DISCONNECTED: &str = "peer-disconnected";
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat-timeout";

impl ControlState {
    /// Starts a request for `target`. Nothing is sent when a precondition
    /// fails.
    pub fn request_remote_mic(
        &mut self,
        target: &str,
        target_known: bool,
        ts: u64,
    ) -> Result<(String, Vec<ControlEffect>), ControlError> {
        if self.remote_mic != RemoteMicSlot::Idle {
            return Err(ControlError::RemoteMicBusy);
        }
        if target == self.local_id {
            return Err(ControlError::RemoteMicSelfTarget);
        }
        if !target_known {
            return Err(ControlError::UnknownPeer(target.to_string()));
        }
        let request_id = new_request_id();
        self.remote_mic = RemoteMicSlot::Requesting {
            request_id: request_id.clone(),
            target: target.to_string(),
        };
        debug!(target = "control", peer_id = %target, request_id = %request_id, "remote mic requested");
        let effects = vec![ControlEffect::SendTo(
            target.to_string(),
            Payload::RemoteMicRequest(RemoteMicRequest {
                request_id: request_id.clone(),
                source_peer_id: self.local_id.clone(),
                source_name: self.local_name.clone(),
                target_peer_id: target.to_string(),
                ts,
            }),
        )];
        Ok((request_id, effects))
    }

    pub fn on_remote_mic_request(
        &mut self,
        from: &str,
        request: RemoteMicRequest,
        ts: u64,
    ) -> Vec<ControlEffect> {
        if request.target_peer_id != self.local_id {
            return Vec::new();
        }
        if self.pending_remote_mic.contains_key(&request.request_id)
            || self.remote_mic.request_id() == Some(request.request_id.as_str())
        {
            return Vec::new();
        }
        if self.remote_mic != RemoteMicSlot::Idle {
            debug!(target = "control", peer_id = %from, request_id = %request.request_id, "remote mic busy; declining");
            return vec![ControlEffect::SendTo(
                from.to_string(),
                Payload::RemoteMicResponse(RemoteMicResponse {
                    request_id: request.request_id,
                    accepted: false,
                    reason: Some(REASON_BUSY.into()),
                    ts,
                }),
            )];
        }
        self.pending_remote_mic.insert(
            request.request_id.clone(),
            PendingRemoteMic {
                source: from.to_string(),
                source_name: request.source_name.clone(),
            },
        );
        vec![ControlEffect::Emit(MeshEvent::RemoteMicRequested {
            request_id: request.request_id,
            source_peer_id: from.to_string(),
            source_name: request.source_name,
        })]
    }

    /// Answers a pending request. Accepting sends `rm_start` but leaves the
    /// target's own routing untouched; only the source goes exclusive. Teardown
    /// still resets routing to broadcast on both sides, which is a no-op here.
    pub fn respond_remote_mic(
        &mut self,
        request_id: &str,
        accepted: bool,
        ts: u64,
        now: Instant,
    ) -> Result<Vec<ControlEffect>, ControlError> {
        if !self.pending_remote_mic.contains_key(request_id) {
            return Err(ControlError::UnknownRemoteMicRequest(request_id.to_string()));
        }
        if accepted && self.remote_mic != RemoteMicSlot::Idle {
            return Err(ControlError::RemoteMicBusy);
        }
        let Some(pending) = self.pending_remote_mic.remove(request_id) else {
            return Err(ControlError::UnknownRemoteMicRequest(request_id.to_string()));
        };

        if !accepted {
            return Ok(vec![ControlEffect::SendTo(
                pending.source,
                Payload::RemoteMicResponse(RemoteMicResponse {
                    request_id: request_id.to_string(),
                    accepted: false,
                    reason: Some(REASON_DECLINED.into()),
                    ts,
                }),
            )]);
        }

        self.remote_mic = RemoteMicSlot::Target {
            request_id: request_id.to_string(),
            source: pending.source.clone(),
        };
        self.remote_mic_last_heard = Some(now);
        info!(target = "control", peer_id = %pending.source, request_id = %request_id, "remote mic accepted");
        Ok(vec![
            ControlEffect::SendTo(
                pending.source.clone(),
                Payload::RemoteMicResponse(RemoteMicResponse {
                    request_id: request_id.to_string(),
                    accepted: true,
                    reason: None,
                    ts,
                }),
            ),
            ControlEffect::SendTo(
                pending.source.clone(),
                Payload::RemoteMicStart(RemoteMicSignal {
                    request_id: request_id.to_string(),
                    ts,
                }),
            ),
            ControlEffect::Emit(MeshEvent::RemoteMicLive {
                request_id: request_id.to_string(),
                peer_id: pending.source,
                role: RemoteMicRole::Target,
            }),
        ])
    }

    pub fn on_remote_mic_response(
        &mut self,
        from: &str,
        response: RemoteMicResponse,
        now: Instant,
    ) -> Vec<ControlEffect> {
        let RemoteMicSlot::Requesting { request_id, target } = &self.remote_mic else {
            return Vec::new();
        };
        if *request_id != response.request_id || target != from {
            return Vec::new();
        }
        let target = target.clone();
        if !response.accepted {
            self.remote_mic = RemoteMicSlot::Idle;
            debug!(target = "control", peer_id = %from, reason = ?response.reason, "remote mic declined");
            return vec![ControlEffect::Emit(MeshEvent::RemoteMicDeclined {
                request_id: response.request_id,
                target_peer_id: target,
                reason: response.reason,
            })];
        }
        self.remote_mic = RemoteMicSlot::Source {
            request_id: response.request_id.clone(),
            target: target.clone(),
            live: false,
        };
        self.remote_mic_last_heard = Some(now);
        info!(target = "control", peer_id = %from, request_id = %response.request_id, "remote mic routing exclusive");
        vec![
            ControlEffect::SetRouting(RoutingMode::Exclusive {
                target: target.clone(),
            }),
            ControlEffect::Emit(MeshEvent::RemoteMicAccepted {
                request_id: response.request_id,
                target_peer_id: target,
            }),
        ]
    }

    pub fn on_remote_mic_start(
        &mut self,
        from: &str,
        signal: RemoteMicSignal,
        now: Instant,
    ) -> Vec<ControlEffect> {
        let RemoteMicSlot::Source {
            request_id,
            target,
            live,
        } = &mut self.remote_mic
        else {
            return Vec::new();
        };
        if *request_id != signal.request_id || target != from || *live {
            return Vec::new();
        }
        *live = true;
        self.remote_mic_last_heard = Some(now);
        vec![ControlEffect::Emit(MeshEvent::RemoteMicLive {
            request_id: signal.request_id,
            peer_id: from.to_string(),
            role: RemoteMicRole::Source,
        })]
    }

    pub fn on_remote_mic_heartbeat(&mut self, from: &str, signal: RemoteMicSignal, now: Instant) {
        if self.remote_mic.is_active()
            && self.remote_mic.request_id() == Some(signal.request_id.as_str())
            && self.remote_mic.counterpart() == Some(from)
        {
            self.remote_mic_last_heard = Some(now);
        }
    }

    pub fn on_remote_mic_stop(&mut self, from: &str, stop: RemoteMicStop) -> Vec<ControlEffect> {
        if self.remote_mic.request_id() == Some(stop.request_id.as_str())
            && self.remote_mic.counterpart() == Some(from)
        {
            return self.teardown_remote_mic(&stop.reason);
        }
        let cancels_pending = self
            .pending_remote_mic
            .get(&stop.request_id)
            .is_some_and(|pending| pending.source == from);
        if cancels_pending {
            self.pending_remote_mic.remove(&stop.request_id);
            return vec![ControlEffect::Emit(MeshEvent::RemoteMicStopped {
                request_id: stop.request_id,
                peer_id: from.to_string(),
                reason: stop.reason,
            })];
        }
        Vec::new()
    }

    /// Local stop. A pending outbound request is cancelled on the target too.
    pub fn stop_remote_mic(&mut self, reason: &str, ts: u64) -> Result<Vec<ControlEffect>, ControlError> {
        let (Some(request_id), Some(counterpart)) = (
            self.remote_mic.request_id().map(str::to_string),
            self.remote_mic.counterpart().map(str::to_string),
        ) else {
            return Err(ControlError::RemoteMicIdle);
        };
        let mut effects = vec![ControlEffect::SendTo(
            counterpart,
            Payload::RemoteMicStop(RemoteMicStop {
                request_id,
                reason: reason.to_string(),
                ts,
            }),
        )];
        effects.extend(self.teardown_remote_mic(reason));
        Ok(effects)
    }

    /// Heartbeats an active session, or stops it when the counterpart has
    /// been silent for `timeout`.
    pub fn remote_mic_tick(&mut self, now: Instant, timeout: Duration, ts: u64) -> Vec<ControlEffect> {
        if !self.remote_mic.is_active() {
            return Vec::new();
        }
        let (Some(request_id), Some(counterpart)) = (
            self.remote_mic.request_id().map(str::to_string),
            self.remote_mic.counterpart().map(str::to_string),
        ) else {
            return Vec::new();
        };
        let silent_for = self
            .remote_mic_last_heard
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        if silent_for >= timeout {
            debug!(target = "control", peer_id = %counterpart, request_id = %request_id, "remote mic heartbeat timeout");
            return self
                .stop_remote_mic(REASON_HEARTBEAT_TIMEOUT, ts)
                .unwrap_or_default();
        }
        vec![ControlEffect::SendTo(
            counterpart,
            Payload::RemoteMicHeartbeat(RemoteMicSignal { request_id, ts }),
        )]
    }

    pub(super) fn remote_mic_peer_left(&mut self, peer_id: &str) -> Vec<ControlEffect> {
        let mut effects = Vec::new();
        let orphaned: Vec<String> = self
            .pending_remote_mic
            .iter()
            .filter(|(_, pending)| pending.source == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in orphaned {
            self.pending_remote_mic.remove(&request_id);
            effects.push(ControlEffect::Emit(MeshEvent::RemoteMicStopped {
                request_id,
                peer_id: peer_id.to_string(),
                reason: REASON_PEER_DISCONNECTED.into(),
            }));
        }
        if self.remote_mic.counterpart() == Some(peer_id) {
            effects.extend(self.teardown_remote_mic(REASON_PEER_DISCONNECTED));
        }
        effects
    }

    fn teardown_remote_mic(&mut self, reason: &str) -> Vec<ControlEffect> {
        let slot = std::mem::replace(&mut self.remote_mic, RemoteMicSlot::Idle);
        self.remote_mic_last_heard = None;
        let (Some(request_id), Some(counterpart)) = (
            slot.request_id().map(str::to_string),
            slot.counterpart().map(str::to_string),
        ) else {
            return Vec::new();
        };
        info!(target = "control", peer_id = %counterpart, request_id = %request_id, reason, "remote mic stopped");
        let mut effects = Vec::new();
        if slot.is_active() {
            effects.push(ControlEffect::SetRouting(RoutingMode::Broadcast));
        }
        effects.push(ControlEffect::Emit(MeshEvent::RemoteMicStopped {
            request_id,
            peer_id: counterpart,
            reason: reason.to_string(),
        }));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Delivers every `SendTo(to, ..)` effect from one side into the other.
    fn deliver(
        effects: &[ControlEffect],
        to: &str,
        from: &str,
        receiver: &mut ControlState,
        now: Instant,
    ) -> Vec<ControlEffect> {
        let mut out = Vec::new();
        for effect in effects {
            let ControlEffect::SendTo(dest, payload) = effect else {
                continue;
            };
            if dest != to {
                continue;
            }
            out.extend(match payload.clone() {
                Payload::RemoteMicRequest(msg) => receiver.on_remote_mic_request(from, msg, 1),
                Payload::RemoteMicResponse(msg) => receiver.on_remote_mic_response(from, msg, now),
                Payload::RemoteMicStart(msg) => receiver.on_remote_mic_start(from, msg, now),
                Payload::RemoteMicHeartbeat(msg) => {
                    receiver.on_remote_mic_heartbeat(from, msg, now);
                    Vec::new()
                }
                Payload::RemoteMicStop(msg) => receiver.on_remote_mic_stop(from, msg),
                other => panic!("unexpected payload {other:?}"),
            });
        }
        out
    }

    fn established(now: Instant) -> (ControlState, ControlState, String) {
        let mut x = ControlState::new("x", "Xavier");
        let mut y = ControlState::new("y", "Yara");
        let (request_id, effects) = x.request_remote_mic("y", true, 1).expect("request");
        deliver(&effects, "y", "x", &mut y, now);
        let effects = y.respond_remote_mic(&request_id, true, 2, now).expect("respond");
        deliver(&effects, "x", "y", &mut x, now);
        (x, y, request_id)
    }

    #[test]
    fn accepted_request_routes_exclusively_to_target() {
        let now = Instant::now();
        let mut x = ControlState::new("x", "Xavier");
        let mut y = ControlState::new("y", "Yara");
        let (request_id, effects) = x.request_remote_mic("y", true, 1).expect("request");
        assert_eq!(
            x.snapshot(|_| None).pending_outgoing_remote_mic_request_id,
            Some(request_id.clone())
        );

        let effects = deliver(&effects, "y", "x", &mut y, now);
        assert!(matches!(&effects[0], ControlEffect::Emit(MeshEvent::RemoteMicRequested { .. })));
        assert!(y.pending_remote_mic().contains_key(&request_id));

        let effects = y.respond_remote_mic(&request_id, true, 2, now).expect("respond");
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, ControlEffect::SetRouting(_))));
        assert!(effects.iter().any(|effect| matches!(
            effect,
            ControlEffect::SendTo(to, Payload::RemoteMicStart(_)) if to == "x"
        )));
        assert!(effects.contains(&ControlEffect::Emit(MeshEvent::RemoteMicLive {
            request_id: request_id.clone(),
            peer_id: "x".into(),
            role: RemoteMicRole::Target,
        })));
        let effects = deliver(&effects, "x", "y", &mut x, now);
        assert!(effects.contains(&ControlEffect::SetRouting(RoutingMode::Exclusive {
            target: "y".into()
        })));

        let snap = x.snapshot(|_| None);
        assert_eq!(snap.active_remote_mic_target_peer_id.as_deref(), Some("y"));
        assert_eq!(snap.active_remote_mic_request_id, Some(request_id.clone()));
        assert!(snap.pending_outgoing_remote_mic_request_id.is_none());
        assert!(snap.remote_mic_live);

        let snap = y.snapshot(|_| None);
        assert_eq!(snap.active_remote_mic_source_peer_id.as_deref(), Some("x"));
        assert!(snap.pending_remote_mic_requests.is_empty());
    }

    #[test]
    fn second_request_is_rejected_locally() {
        let mut x = ControlState::new("x", "Xavier");
        x.request_remote_mic("y", true, 1).expect("first");
        assert_eq!(
            x.request_remote_mic("z", true, 2),
            Err(ControlError::RemoteMicBusy)
        );
        let mut idle = ControlState::new("x", "Xavier");
        assert_eq!(
            idle.request_remote_mic("x", true, 1),
            Err(ControlError::RemoteMicSelfTarget)
        );
        assert_eq!(
            idle.request_remote_mic("ghost", false, 1),
            Err(ControlError::UnknownPeer("ghost".into()))
        );
        assert_eq!(idle.stop_remote_mic(REASON_STOPPED, 1), Err(ControlError::RemoteMicIdle));
    }

    #[test]
    fn busy_target_auto_declines() {
        let now = Instant::now();
        let (_x, mut y, _) = established(now);
        let effects = y.on_remote_mic_request(
            "z",
            RemoteMicRequest {
                request_id: "other".into(),
                source_peer_id: "z".into(),
                source_name: "Zoe".into(),
                target_peer_id: "y".into(),
                ts: 5,
            },
            5,
        );
        assert!(matches!(
            &effects[0],
            ControlEffect::SendTo(to, Payload::RemoteMicResponse(RemoteMicResponse { accepted: false, reason: Some(reason), .. }))
                if to == "z" && reason == REASON_BUSY
        ));
        assert!(y.pending_remote_mic().is_empty());
    }

    #[test]
    fn declined_request_returns_requester_to_idle() {
        let now = Instant::now();
        let mut x = ControlState::new("x", "Xavier");
        let mut y = ControlState::new("y", "Yara");
        let (request_id, effects) = x.request_remote_mic("y", true, 1).expect("request");
        deliver(&effects, "y", "x", &mut y, now);
        let effects = y.respond_remote_mic(&request_id, false, 2, now).expect("respond");
        let effects = deliver(&effects, "x", "y", &mut x, now);
        assert!(matches!(
            &effects[0],
            ControlEffect::Emit(MeshEvent::RemoteMicDeclined { reason: Some(reason), .. }) if reason == REASON_DECLINED
        ));
        assert_eq!(*x.remote_mic(), RemoteMicSlot::Idle);
        assert_eq!(*y.remote_mic(), RemoteMicSlot::Idle);
    }

    #[test]
    fn stop_from_either_side_clears_both() {
        for stopper in ["x", "y"] {
            let now = Instant::now();
            let (mut x, mut y, _) = established(now);
            let (stopping, other, other_id) = if stopper == "x" {
                (&mut x, &mut y, "y")
            } else {
                (&mut y, &mut x, "x")
            };
            let effects = stopping.stop_remote_mic(REASON_STOPPED, 9).expect("stop");
            assert!(effects.contains(&ControlEffect::SetRouting(RoutingMode::Broadcast)));
            let remote = deliver(&effects, other_id, stopper, other, now);
            assert!(remote.contains(&ControlEffect::SetRouting(RoutingMode::Broadcast)));
            assert!(remote.iter().any(|effect| matches!(
                effect,
                ControlEffect::Emit(MeshEvent::RemoteMicStopped { reason, .. }) if reason == REASON_STOPPED
            )));
            assert_eq!(*x.remote_mic(), RemoteMicSlot::Idle);
            assert_eq!(*y.remote_mic(), RemoteMicSlot::Idle);
        }
    }

    #[test]
    fn silence_stops_session_with_timeout_reason() {
        let start = Instant::now();
        let (mut x, _y, _) = established(start);
        let timeout = Duration::from_secs(8);

        let beat = x.remote_mic_tick(start + Duration::from_secs(2), timeout, 3);
        assert!(matches!(
            &beat[0],
            ControlEffect::SendTo(to, Payload::RemoteMicHeartbeat(_)) if to == "y"
        ));

        let stopped = x.remote_mic_tick(start + Duration::from_secs(9), timeout, 4);
        assert!(stopped.contains(&ControlEffect::SetRouting(RoutingMode::Broadcast)));
        assert!(stopped.iter().any(|effect| matches!(
            effect,
            ControlEffect::Emit(MeshEvent::RemoteMicStopped { reason, .. }) if reason == REASON_HEARTBEAT_TIMEOUT
        )));
        assert_eq!(*x.remote_mic(), RemoteMicSlot::Idle);
    }

    #[test]
    fn counterpart_disconnect_synthesizes_stop() {
        let now = Instant::now();
        let (mut x, _y, _) = established(now);
        let effects = x.on_peer_left("y", 10);
        assert!(effects.contains(&ControlEffect::SetRouting(RoutingMode::Broadcast)));
        assert!(effects.iter().any(|effect| matches!(
            effect,
            ControlEffect::Emit(MeshEvent::RemoteMicStopped { reason, .. }) if reason == REASON_PEER_DISCONNECTED
        )));
        // No wire message to a peer that is gone.
        assert!(!effects.iter().any(|effect| matches!(effect, ControlEffect::SendTo(..))));
    }

    #[test]
    fn cancelling_pending_request_clears_target_prompt() {
        let now = Instant::now();
        let mut x = ControlState::new("x", "Xavier");
        let mut y = ControlState::new("y", "Yara");
        let (request_id, effects) = x.request_remote_mic("y", true, 1).expect("request");
        deliver(&effects, "y", "x", &mut y, now);

        let effects = x.stop_remote_mic(REASON_STOPPED, 2).expect("cancel");
        assert!(!effects.contains(&ControlEffect::SetRouting(RoutingMode::Broadcast)));
        deliver(&effects, "y", "x", &mut y, now);
        assert!(!y.pending_remote_mic().contains_key(&request_id));
        assert_eq!(
            y.respond_remote_mic(&request_id, true, 3, now),
            Err(ControlError::UnknownRemoteMicRequest(request_id))
        );
    }
}

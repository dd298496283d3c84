use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};

use super::{LocalIdentity, SharedViews};
use crate::audio::AudioPipeline;
use crate::config::MeshConfig;
use crate::control::remote_mic::{REASON_LEFT, REASON_STOPPED};
use crate::control::{ControlEffect, ControlError, ControlState};
use crate::events::{EventSink, LeaveReason, MeshEvent};
use crate::protocol::dedup::{Admission, DedupWindow};
use crate::protocol::{Announce, Empty, Envelope, MediaState, Payload, unix_millis};
use crate::session::{
    Negotiation, NegotiationInput, NegotiationPhase, NegotiationUpdate, Peer, PeerLink,
    PeerRegistry, QualitySample, spawn_negotiation,
};
use crate::transport::rtc::ConnectionFactory;
use crate::transport::{BrokerSet, InboundFrame, TransportError};

pub(crate) enum Command {
    SetRoomLock {
        locked: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    RequestMuteAll {
        reply: oneshot::Sender<String>,
    },
    RespondMuteAll {
        request_id: String,
        accepted: bool,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    SetHandRaised {
        raised: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    RequestRemoteMic {
        target: String,
        reply: oneshot::Sender<Result<String, ControlError>>,
    },
    RespondRemoteMic {
        request_id: String,
        accepted: bool,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    StopRemoteMic {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    SetMediaState {
        media: MediaState,
        reply: oneshot::Sender<()>,
    },
    ReportQuality {
        peer_id: String,
        sample: QualitySample,
        reply: oneshot::Sender<bool>,
    },
    Leave {
        reply: oneshot::Sender<Vec<JoinHandle<()>>>,
    },
}

/// Owns the registry, control state and dedup window for one session.
pub(crate) struct Dispatcher {
    config: MeshConfig,
    identity: LocalIdentity,
    brokers: BrokerSet,
    factory: Arc<dyn ConnectionFactory>,
    audio: Arc<dyn AudioPipeline>,
    events: Arc<dyn EventSink>,
    views: SharedViews,
    registry: PeerRegistry,
    control: ControlState,
    dedup: DedupWindow,
    local_media: MediaState,
    transport_down: bool,
    next_link: u64,
    updates_tx: mpsc::UnboundedSender<NegotiationUpdate>,
    updates_rx: Option<mpsc::UnboundedReceiver<NegotiationUpdate>>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: MeshConfig,
        identity: LocalIdentity,
        brokers: BrokerSet,
        factory: Arc<dyn ConnectionFactory>,
        audio: Arc<dyn AudioPipeline>,
        events: Arc<dyn EventSink>,
        views: SharedViews,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let control = ControlState::new(identity.peer_id.clone(), identity.display_name.clone());
        let dedup = DedupWindow::new(config.dedup_capacity, config.dedup_ttl);
        Self {
            config,
            identity,
            brokers,
            factory,
            audio,
            events,
            views,
            registry: PeerRegistry::new(),
            control,
            dedup,
            local_media: MediaState::default(),
            transport_down: false,
            next_link: 0,
            updates_tx,
            updates_rx: Some(updates_rx),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        let Some(mut updates) = self.updates_rx.take() else {
            return;
        };
        let start = Instant::now();
        let mut heartbeat = interval_at(
            start + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut remote_mic_tick = interval_at(
            start + self.config.remote_mic_heartbeat_interval,
            self.config.remote_mic_heartbeat_interval,
        );
        remote_mic_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.send(None, Payload::Announce(self.announce_body()));
        self.publish_views();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave { reply }) => {
                        let handles = self.shutdown();
                        self.reply(reply, handles);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!(target = "mesh", "peer manager handle dropped");
                        self.shutdown();
                        break;
                    }
                },
                Some(frame) = inbound.recv() => self.handle_frame(frame),
                Some(update) = updates.recv() => self.handle_update(update),
                _ = heartbeat.tick() => self.on_heartbeat(),
                _ = remote_mic_tick.tick() => self.on_remote_mic_tick(),
            }
            self.publish_views();
        }
        self.publish_views();
    }

    fn announce_body(&self) -> Announce {
        Announce {
            name: self.identity.display_name.clone(),
            platform: self.identity.platform.clone(),
            reply: false,
        }
    }

    fn publish_views(&self) {
        let now = Instant::now();
        let registry = &self.registry;
        let control = self
            .control
            .snapshot(|id| registry.display_name(id).map(str::to_string));
        self.views
            .publish(registry.snapshots(now), now, control, self.local_media);
    }

    fn emit(&self, event: MeshEvent) {
        self.events.handle(event);
    }

    fn send(&mut self, to: Option<&str>, payload: Payload) {
        let kind = payload.kind();
        match self.brokers.send(to, payload) {
            Ok(delivery) => {
                if delivery.accepted < delivery.attempted {
                    trace!(
                        target = "transport",
                        kind,
                        accepted = delivery.accepted,
                        attempted = delivery.attempted,
                        "partial broker delivery"
                    );
                }
                if self.transport_down {
                    self.transport_down = false;
                    self.views.set_transport_up(true);
                    info!(target = "transport", "broker connectivity restored");
                    self.emit(MeshEvent::TransportRestored);
                    if kind != "announce" {
                        let announce = Payload::Announce(self.announce_body());
                        if let Err(err) = self.brokers.send(None, announce) {
                            debug!(target = "transport", error = %err, "re-announce failed");
                        }
                    }
                }
            }
            Err(TransportError::AllBrokersDown) => {
                if !self.transport_down {
                    self.transport_down = true;
                    self.views.set_transport_up(false);
                    warn!(target = "transport", kind, "no broker accepted publish; transport down");
                    self.emit(MeshEvent::TransportDown);
                }
            }
            Err(err) => {
                warn!(target = "transport", kind, error = %err, "failed to send envelope");
            }
        }
    }

    fn apply(&mut self, effects: Vec<ControlEffect>) {
        for effect in effects {
            match effect {
                ControlEffect::Broadcast(payload) => self.send(None, payload),
                ControlEffect::SendTo(peer_id, payload) => self.send(Some(&peer_id), payload),
                ControlEffect::Emit(event) => self.emit(event),
                ControlEffect::SetRouting(mode) => {
                    debug!(target = "control", mode = ?mode, "audio routing changed");
                    self.audio.set_routing_mode(mode);
                }
                ControlEffect::MuteLocalMic => {
                    let media = MediaState {
                        mic_muted: true,
                        ..self.local_media
                    };
                    self.set_local_media(media);
                }
                ControlEffect::RaisedHandsChanged => {
                    let registry = &self.registry;
                    let queue = self
                        .control
                        .raised_hands_queue(|id| registry.display_name(id).map(str::to_string));
                    self.emit(MeshEvent::RaisedHandsChanged { queue });
                }
            }
        }
    }

    fn set_local_media(&mut self, media: MediaState) {
        if media.mic_muted != self.local_media.mic_muted {
            self.audio.set_mic_muted(media.mic_muted);
        }
        if media == self.local_media {
            return;
        }
        self.local_media = media;
        self.send(None, Payload::PeerState(media));
        self.emit(MeshEvent::LocalMediaChanged { media });
    }

    /// Snapshots are published before the reply goes out.
    fn reply<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish_views();
        let _ = reply.send(value);
    }

    fn handle_command(&mut self, command: Command) {
        let ts = unix_millis();
        match command {
            Command::SetRoomLock { locked, reply } => {
                let effects = match locked {
                    Some(locked) => self.control.set_room_lock(locked, ts),
                    None => self.control.toggle_room_lock(ts),
                };
                self.apply(effects);
                self.reply(reply, self.control.lock().is_locked());
            }
            Command::RequestMuteAll { reply } => {
                let (request_id, effects) = self.control.request_mute_all(ts);
                self.apply(effects);
                self.reply(reply, request_id);
            }
            Command::RespondMuteAll {
                request_id,
                accepted,
                reply,
            } => {
                let result = self
                    .control
                    .respond_mute_all(&request_id, accepted, ts)
                    .map(|effects| self.apply(effects));
                self.reply(reply, result);
            }
            Command::SetHandRaised { raised, reply } => {
                let effects = match raised {
                    Some(raised) => self.control.set_hand_raised(raised, ts),
                    None => self.control.toggle_hand_raise(ts),
                };
                self.apply(effects);
                self.reply(reply, self.control.local_hand_raised());
            }
            Command::RequestRemoteMic { target, reply } => {
                let known = self.registry.contains(&target);
                let result = self
                    .control
                    .request_remote_mic(&target, known, ts)
                    .map(|(request_id, effects)| {
                        self.apply(effects);
                        request_id
                    });
                self.reply(reply, result);
            }
            Command::RespondRemoteMic {
                request_id,
                accepted,
                reply,
            } => {
                let result = self
                    .control
                    .respond_remote_mic(&request_id, accepted, ts, Instant::now())
                    .map(|effects| self.apply(effects));
                self.reply(reply, result);
            }
            Command::StopRemoteMic { reply } => {
                let result = self
                    .control
                    .stop_remote_mic(REASON_STOPPED, ts)
                    .map(|effects| self.apply(effects));
                self.reply(reply, result);
            }
            Command::SetMediaState { media, reply } => {
                self.set_local_media(media);
                self.reply(reply, ());
            }
            Command::ReportQuality {
                peer_id,
                sample,
                reply,
            } => {
                let known = match self.registry.get_mut(&peer_id) {
                    Some(peer) => {
                        peer.quality = Some(sample);
                        true
                    }
                    None => false,
                };
                self.reply(reply, known);
            }
            Command::Leave { reply } => {
                let handles = self.shutdown();
                self.reply(reply, handles);
            }
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        let envelope = match Envelope::decode(&frame.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target = "mesh", broker = %frame.broker, error = %err, "dropping invalid envelope");
                return;
            }
        };
        if !envelope.is_for(&self.identity.peer_id) {
            return;
        }
        let now = Instant::now();
        if self.dedup.admit(&envelope.from, &envelope.msg_id, now) == Admission::Drop {
            trace!(
                target = "dedup",
                broker = %frame.broker,
                peer_id = %envelope.from,
                msg_id = %envelope.msg_id,
                "duplicate envelope dropped"
            );
            return;
        }
        self.route(envelope, now);
    }

    fn route(&mut self, envelope: Envelope, now: Instant) {
        let Envelope {
            from,
            to,
            session_id,
            payload,
            ..
        } = envelope;

        if let Some(peer) = self.registry.get(&from) {
            if peer.session_id != session_id {
                if matches!(payload, Payload::Announce(_) | Payload::Offer(_)) {
                    info!(target = "mesh", peer_id = %from, "peer rejoined with a new session");
                    self.remove_peer(&from, LeaveReason::SessionReplaced);
                } else {
                    debug!(
                        target = "mesh",
                        peer_id = %from,
                        kind = payload.kind(),
                        "dropping message from a replaced session"
                    );
                    return;
                }
            }
        }

        let is_heartbeat = matches!(payload, Payload::Heartbeat(_));
        self.registry.touch(&from, now, is_heartbeat);
        let ts = unix_millis();

        match payload {
            Payload::Announce(announce) => self.on_announce(&from, to.is_none(), session_id, announce),
            Payload::Leave(Empty {}) => {
                self.remove_peer(&from, LeaveReason::Left);
            }
            Payload::Heartbeat(Empty {}) => {
                if !self.registry.contains(&from) {
                    debug!(
                        target = "mesh",
                        peer_id = %from,
                        "heartbeat from unknown peer; requesting announce"
                    );
                    let announce = Announce {
                        reply: true,
                        ..self.announce_body()
                    };
                    self.send(Some(&from), Payload::Announce(announce));
                }
            }
            Payload::Offer(offer) => {
                self.ensure_peer(&from, session_id, now);
                self.forward(&from, NegotiationInput::Offer(offer));
            }
            Payload::Answer(answer) => self.forward(&from, NegotiationInput::Answer(answer)),
            Payload::IceCandidate(candidate) => {
                self.ensure_peer(&from, session_id, now);
                self.forward(&from, NegotiationInput::Candidate(candidate));
            }
            Payload::PeerState(media) => {
                if let Some(peer) = self.registry.get_mut(&from) {
                    if peer.media != media {
                        peer.media = media;
                        self.emit(MeshEvent::PeerMediaChanged {
                            peer_id: from,
                            media,
                        });
                    }
                }
            }
            Payload::RoomLock(message) => {
                let effects = self.control.on_room_lock(&from, message);
                self.apply(effects);
            }
            Payload::RoomLockedNotice(notice) => {
                let effects = self.control.on_room_locked_notice(&from, notice, ts);
                self.apply(effects);
            }
            Payload::MuteAllRequest(request) => {
                let effects = self.control.on_mute_all_request(&from, request);
                self.apply(effects);
            }
            Payload::MuteAllResponse(response) => {
                let effects = self.control.on_mute_all_response(&from, response);
                self.apply(effects);
            }
            Payload::HandRaise(message) => {
                let effects = self.control.on_hand_raise(&from, message);
                self.apply(effects);
            }
            Payload::RemoteMicRequest(request) => {
                let effects = self.control.on_remote_mic_request(&from, request, ts);
                self.apply(effects);
            }
            Payload::RemoteMicResponse(response) => {
                let effects = self.control.on_remote_mic_response(&from, response, now);
                self.apply(effects);
            }
            Payload::RemoteMicStart(signal) => {
                let effects = self.control.on_remote_mic_start(&from, signal, now);
                self.apply(effects);
            }
            Payload::RemoteMicHeartbeat(signal) => {
                self.control.on_remote_mic_heartbeat(&from, signal, now);
            }
            Payload::RemoteMicStop(stop) => {
                let effects = self.control.on_remote_mic_stop(&from, stop);
                self.apply(effects);
            }
        }
    }

    fn on_announce(&mut self, from: &str, broadcast: bool, session_id: u32, announce: Announce) {
        if let Some(peer) = self.registry.get_mut(from) {
            peer.name = announce.name;
            peer.platform = announce.platform;
            if announce.reply {
                // A connected link is stale: the sender no longer has its end.
                if peer.phase == NegotiationPhase::Connected {
                    info!(target = "mesh", peer_id = %from, "peer lost track of us; renegotiating");
                    self.restart_link(from);
                }
                self.send(Some(from), Payload::Announce(self.announce_body()));
                self.forward(from, NegotiationInput::Initiate);
            }
            return;
        }
        self.add_peer(from, &announce.name, &announce.platform, session_id, Instant::now());
        if broadcast || announce.reply {
            // Late joiners only hear our announce if we answer theirs.
            self.send(Some(from), Payload::Announce(self.announce_body()));
        }
        self.forward(from, NegotiationInput::Initiate);
    }

    /// Creates a record for a peer first seen through negotiation traffic.
    fn ensure_peer(&mut self, peer_id: &str, session_id: u32, now: Instant) {
        if !self.registry.contains(peer_id) {
            self.add_peer(peer_id, peer_id, "unknown", session_id, now);
        }
    }

    fn add_peer(&mut self, peer_id: &str, name: &str, platform: &str, session_id: u32, now: Instant) {
        let mut peer = Peer::new(peer_id, name, platform, session_id, now);
        peer.link = Some(self.spawn_link(peer_id));
        self.registry.insert(peer);
        info!(target = "mesh", peer_id = %peer_id, name = %name, "peer joined");
        self.emit(MeshEvent::PeerJoined {
            peer_id: peer_id.to_string(),
            name: name.to_string(),
            platform: platform.to_string(),
        });
        let effects = self.control.on_peer_joined(peer_id);
        self.apply(effects);
        if self.local_media != MediaState::default() {
            self.send(Some(peer_id), Payload::PeerState(self.local_media));
        }
    }

    fn spawn_link(&mut self, peer_id: &str) -> PeerLink {
        self.next_link += 1;
        let link = self.next_link;
        let (negotiation, connection_events) =
            Negotiation::new(self.identity.peer_id.clone(), peer_id, Arc::clone(&self.factory));
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let task = spawn_negotiation(
            negotiation,
            connection_events,
            inputs_rx,
            self.updates_tx.clone(),
            link,
            self.config.negotiation_timeout,
        );
        PeerLink {
            id: link,
            inputs,
            task,
        }
    }

    /// Replaces the peer's negotiation; the old task closes its connection
    /// once its input channel drops.
    fn restart_link(&mut self, peer_id: &str) {
        let link = self.spawn_link(peer_id);
        let Some(peer) = self.registry.get_mut(peer_id) else {
            return;
        };
        let _ = peer.release();
        peer.link = Some(link);
        peer.phase = NegotiationPhase::Idle;
        self.emit(MeshEvent::PeerPhaseChanged {
            peer_id: peer_id.to_string(),
            phase: NegotiationPhase::Idle,
        });
    }

    fn forward(&self, peer_id: &str, input: NegotiationInput) {
        let Some(link) = self.registry.get(peer_id).and_then(|peer| peer.link.as_ref()) else {
            trace!(target = "negotiation", peer_id = %peer_id, "no negotiation for peer");
            return;
        };
        if !link.send(input) {
            debug!(target = "negotiation", peer_id = %peer_id, "negotiation task already stopped");
        }
    }

    fn remove_peer(&mut self, peer_id: &str, reason: LeaveReason) -> Option<JoinHandle<()>> {
        let mut peer = self.registry.remove(peer_id)?;
        let handle = peer.release();
        info!(target = "mesh", peer_id = %peer_id, reason = ?reason, "peer left");
        self.emit(MeshEvent::PeerLeft {
            peer_id: peer_id.to_string(),
            reason,
        });
        let effects = self.control.on_peer_left(peer_id, unix_millis());
        self.apply(effects);
        handle
    }

    fn handle_update(&mut self, update: NegotiationUpdate) {
        let (peer_id, link) = match &update {
            NegotiationUpdate::Outbound { peer_id, link, .. }
            | NegotiationUpdate::Phase { peer_id, link, .. }
            | NegotiationUpdate::Failed { peer_id, link, .. } => (peer_id.clone(), *link),
        };
        let current = self.registry.get(&peer_id).and_then(Peer::link_id);
        if current != Some(link) {
            trace!(target = "negotiation", peer_id = %peer_id, link, "update from replaced negotiation");
            return;
        }
        match update {
            NegotiationUpdate::Outbound { payload, .. } => self.send(Some(&peer_id), payload),
            NegotiationUpdate::Phase { phase, .. } => {
                if let Some(peer) = self.registry.get_mut(&peer_id) {
                    peer.phase = phase;
                }
                debug!(target = "negotiation", peer_id = %peer_id, phase = ?phase, "phase changed");
                self.emit(MeshEvent::PeerPhaseChanged { peer_id, phase });
            }
            NegotiationUpdate::Failed { reason, .. } => {
                self.remove_peer(&peer_id, LeaveReason::NegotiationFailed(reason));
            }
        }
    }

    fn on_heartbeat(&mut self) {
        let now = Instant::now();
        self.send(None, Payload::Heartbeat(Empty {}));
        for peer_id in self.registry.stale(now, self.config.peer_timeout) {
            warn!(target = "mesh", peer_id = %peer_id, "peer timed out");
            self.remove_peer(&peer_id, LeaveReason::Timeout);
        }
        let evicted = self.dedup.evict_expired(now);
        if evicted > 0 {
            trace!(target = "dedup", evicted, remaining = self.dedup.len(), "expired dedup keys");
        }
    }

    fn on_remote_mic_tick(&mut self) {
        let effects =
            self.control
                .remote_mic_tick(Instant::now(), self.config.remote_mic_timeout, unix_millis());
        self.apply(effects);
    }

    /// Best-effort goodbye, then releases every negotiation.
    fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        let ts = unix_millis();
        if let Ok(effects) = self.control.stop_remote_mic(REASON_LEFT, ts) {
            self.apply(effects);
        }
        self.send(None, Payload::Leave(Empty {}));
        let mut handles = Vec::new();
        for mut peer in self.registry.drain() {
            if let Some(handle) = peer.release() {
                handles.push(handle);
            }
            self.emit(MeshEvent::PeerLeft {
                peer_id: peer.peer_id,
                reason: LeaveReason::LocalShutdown,
            });
        }
        info!(target = "mesh", peer_id = %self.identity.peer_id, peers = handles.len(), "leaving room");
        handles
    }
}

//! `PeerManager`: the handle a host application holds for one room session.
//!
//! Everything that mutates peer or control state happens on the dispatch task;
//! the methods here either read the snapshots it publishes or queue a command
//! and wait for its reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use transport_bus::Bus;

use crate::audio::{AudioError, AudioPipeline, MediaStreamHandle};
use crate::config::{ConfigError, MeshConfig};
use crate::control::{ControlError, ControlSnapshot};
use crate::events::EventSink;
use crate::protocol::MediaState;
use crate::session::{PeerSnapshot, QualitySample};
use crate::transport::rtc::ConnectionFactory;
use crate::transport::{BrokerSet, TransportError};

mod dispatch;

use dispatch::{Command, Dispatcher};

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("peer manager has shut down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub display_name: String,
    pub platform: String,
}

impl LocalIdentity {
    /// Identity with a fresh random peer id.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            peer_id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            platform: std::env::consts::OS.to_string(),
        }
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = peer_id.into();
        self
    }
}

/// External components the core drives but does not implement.
pub struct MeshCollaborators {
    pub brokers: Vec<Arc<dyn Bus>>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub audio: Arc<dyn AudioPipeline>,
    pub events: Arc<dyn EventSink>,
    pub local_stream: Option<MediaStreamHandle>,
}

#[derive(Debug, Default)]
struct PeerView {
    taken_at: Option<Instant>,
    peers: Vec<PeerSnapshot>,
}

/// Read-side copies of dispatcher state.
#[derive(Debug, Clone)]
pub(crate) struct SharedViews {
    peers: Arc<RwLock<PeerView>>,
    control: Arc<RwLock<ControlSnapshot>>,
    local_media: Arc<RwLock<MediaState>>,
    transport_up: Arc<AtomicBool>,
}

impl Default for SharedViews {
    fn default() -> Self {
        Self {
            peers: Arc::default(),
            control: Arc::default(),
            local_media: Arc::default(),
            transport_up: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl SharedViews {
    pub(crate) fn publish(
        &self,
        peers: Vec<PeerSnapshot>,
        taken_at: Instant,
        control: ControlSnapshot,
        local_media: MediaState,
    ) {
        *self.peers.write() = PeerView {
            taken_at: Some(taken_at),
            peers,
        };
        *self.control.write() = control;
        *self.local_media.write() = local_media;
    }

    pub(crate) fn set_transport_up(&self, up: bool) {
        self.transport_up.store(up, Ordering::SeqCst);
    }
}

pub struct PeerManager {
    local_id: String,
    session_id: u32,
    topic: String,
    shutdown_grace: Duration,
    commands: mpsc::UnboundedSender<Command>,
    views: SharedViews,
    audio: Arc<dyn AudioPipeline>,
    processed_stream: Option<MediaStreamHandle>,
    dispatch: Option<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
}

impl PeerManager {
    /// Joins `config.room`: subscribes on every broker, starts the dispatch
    /// task and announces the local peer.
    pub async fn join(
        config: MeshConfig,
        identity: LocalIdentity,
        collaborators: MeshCollaborators,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let MeshCollaborators {
            brokers,
            connections,
            audio,
            events,
            local_stream,
        } = collaborators;

        let processed_stream = local_stream
            .map(|stream| audio.process_input(stream))
            .transpose()?;

        let session_id: u32 = rand::random();
        let topic = config.topic();
        let brokers = BrokerSet::new(brokers, topic.clone(), identity.peer_id.clone(), session_id)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pumps = brokers.spawn_pumps(inbound_tx);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let views = SharedViews::default();

        info!(
            target = "mesh",
            peer_id = %identity.peer_id,
            session_id = %format!("{session_id:08x}"),
            topic = %topic,
            "joining room"
        );

        let local_id = identity.peer_id.clone();
        let shutdown_grace = config.shutdown_grace;
        let dispatcher = Dispatcher::new(
            config,
            identity,
            brokers,
            connections,
            Arc::clone(&audio),
            events,
            views.clone(),
        );
        let dispatch = tokio::spawn(dispatcher.run(commands_rx, inbound_rx));

        Ok(Self {
            local_id,
            session_id,
            topic,
            shutdown_grace,
            commands: commands_tx,
            views,
            audio,
            processed_stream,
            dispatch: Some(dispatch),
            pumps,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The audio pipeline's output for the stream passed at join time.
    pub fn processed_stream(&self) -> Option<&MediaStreamHandle> {
        self.processed_stream.as_ref()
    }

    pub fn input_level(&self) -> f32 {
        self.audio.input_level()
    }

    pub fn is_transport_up(&self) -> bool {
        self.views.transport_up.load(Ordering::SeqCst)
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let view = self.views.peers.read();
        let elapsed = view
            .taken_at
            .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        view.peers
            .iter()
            .cloned()
            .map(|mut snapshot| {
                snapshot.last_seen_ms_ago = snapshot.last_seen_ms_ago.saturating_add(elapsed);
                snapshot.last_ping_ms_ago = snapshot
                    .last_ping_ms_ago
                    .map(|ago| ago.saturating_add(elapsed));
                snapshot
            })
            .collect()
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerSnapshot> {
        self.peers()
            .into_iter()
            .find(|snapshot| snapshot.peer_id == peer_id)
    }

    pub fn control(&self) -> ControlSnapshot {
        self.views.control.read().clone()
    }

    pub fn local_media(&self) -> MediaState {
        *self.views.local_media.read()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MeshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| MeshError::Closed)?;
        reply_rx.await.map_err(|_| MeshError::Closed)
    }

    /// Returns whether the room is locked afterwards.
    pub async fn toggle_room_lock(&self) -> Result<bool, MeshError> {
        self.request(|reply| Command::SetRoomLock {
            locked: None,
            reply,
        })
        .await
    }

    pub async fn set_room_lock(&self, locked: bool) -> Result<bool, MeshError> {
        self.request(|reply| Command::SetRoomLock {
            locked: Some(locked),
            reply,
        })
        .await
    }

    /// Returns the id of the broadcast request.
    pub async fn request_mute_all(&self) -> Result<String, MeshError> {
        self.request(|reply| Command::RequestMuteAll { reply }).await
    }

    pub async fn respond_mute_all(&self, request_id: &str, accepted: bool) -> Result<(), MeshError> {
        let request_id = request_id.to_string();
        Ok(self
            .request(|reply| Command::RespondMuteAll {
                request_id,
                accepted,
                reply,
            })
            .await??)
    }

    /// Returns whether the local hand is raised afterwards.
    pub async fn set_hand_raised(&self, raised: bool) -> Result<bool, MeshError> {
        self.request(|reply| Command::SetHandRaised {
            raised: Some(raised),
            reply,
        })
        .await
    }

    pub async fn toggle_hand_raise(&self) -> Result<bool, MeshError> {
        self.request(|reply| Command::SetHandRaised {
            raised: None,
            reply,
        })
        .await
    }

    /// Asks `target` to take the remote mic. Returns the request id.
    pub async fn request_remote_mic(&self, target: &str) -> Result<String, MeshError> {
        let target = target.to_string();
        Ok(self
            .request(|reply| Command::RequestRemoteMic { target, reply })
            .await??)
    }

    pub async fn respond_remote_mic(&self, request_id: &str, accepted: bool) -> Result<(), MeshError> {
        let request_id = request_id.to_string();
        Ok(self
            .request(|reply| Command::RespondRemoteMic {
                request_id,
                accepted,
                reply,
            })
            .await??)
    }

    pub async fn stop_remote_mic(&self) -> Result<(), MeshError> {
        Ok(self
            .request(|reply| Command::StopRemoteMic { reply })
            .await??)
    }

    pub async fn set_media_state(&self, media: MediaState) -> Result<(), MeshError> {
        self.request(|reply| Command::SetMediaState { media, reply })
            .await
    }

    /// Feeds a stats sample for `peer_id`. Returns `false` for unknown peers.
    pub async fn report_quality(
        &self,
        peer_id: &str,
        rtt_ms: f64,
        packet_loss: f64,
    ) -> Result<bool, MeshError> {
        let peer_id = peer_id.to_string();
        let sample = QualitySample::new(rtt_ms, packet_loss);
        self.request(|reply| Command::ReportQuality {
            peer_id,
            sample,
            reply,
        })
        .await
    }

    /// Leaves the room: best-effort `rm_stop` and `leave`, then closes every
    /// connection object within the shutdown grace period.
    pub async fn leave(mut self) -> Result<(), MeshError> {
        let handles = self.request(|reply| Command::Leave { reply }).await?;
        let grace = self.shutdown_grace;
        if timeout(grace, join_all(handles)).await.is_err() {
            warn!(target = "mesh", ?grace, "negotiation tasks still running after shutdown grace");
        }
        if let Some(dispatch) = self.dispatch.take() {
            if timeout(grace, dispatch).await.is_err() {
                warn!(target = "mesh", "dispatch loop did not stop in time");
            }
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        debug!(target = "mesh", peer_id = %self.local_id, "left room");
        Ok(())
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

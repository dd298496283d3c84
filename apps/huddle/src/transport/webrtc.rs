//! `ConnectionFactory` backed by the `webrtc` crate.
//!
//! Each connection negotiates one bidirectional audio transceiver. Media
//! capture and playback stay with the embedding application; only SDP, ICE
//! and connection state cross this boundary.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::rtc::{
    ConnectionEvent, ConnectionFactory, ConnectionState, IceCandidate, PeerConnection, RtcError,
    SdpKind, SessionDescription,
};
use crate::config::MeshConfig;

fn backend(err: webrtc::Error) -> RtcError {
    RtcError::Backend(err.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct WebRtcConnectionFactory {
    ice_servers: Vec<String>,
}

impl WebRtcConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &MeshConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        remote_peer_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Box<dyn PeerConnection>, RtcError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(backend)?,
        );
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .map_err(backend)?;

        let candidate_tx = events.clone();
        let peer = remote_peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target = "webrtc", peer_id = %peer, "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::LocalCandidate {
                            generation,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        });
                    }
                    Err(err) => {
                        debug!(target = "webrtc", peer_id = %peer, error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                let _ = tx.send(ConnectionEvent::StateChanged {
                    generation,
                    state: mapped,
                });
            })
        }));

        Ok(Box::new(WebRtcConnection { pc }))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    async fn install_local(&self, desc: RTCSessionDescription) -> Result<SessionDescription, RtcError> {
        self.pc
            .set_local_description(desc.clone())
            .await
            .map_err(backend)?;
        let kind = if desc.sdp_type == RTCSdpType::Answer {
            SdpKind::Answer
        } else {
            SdpKind::Offer
        };
        Ok(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        self.install_local(offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        self.install_local(answer).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let desc = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|err| RtcError::InvalidDescription(err.to_string()))?;
        self.pc.set_remote_description(desc).await.map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(backend)
    }

    async fn close(&self) -> Result<(), RtcError> {
        self.pc.close().await.map_err(backend)
    }
}

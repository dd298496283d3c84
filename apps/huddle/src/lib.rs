//! Peer negotiation and control protocol for serverless mesh rooms.
//!
//! A [`PeerManager`] joins a room over one or more redundant signaling
//! brokers, negotiates a WebRTC connection with every peer it hears from and
//! replicates the room's moderation state (lock, mute-all, raised hands,
//! remote mic) over the same channel.

pub mod audio;
pub mod config;
pub mod control;
pub mod events;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use audio::{AudioPipeline, MediaStreamHandle, PassthroughAudio, RoutingMode};
pub use config::{ConfigError, MeshConfig};
pub use control::{ControlError, ControlSnapshot};
pub use events::{EventSink, LeaveReason, MeshEvent};
pub use manager::{LocalIdentity, MeshCollaborators, MeshError, PeerManager};
pub use protocol::MediaState;
pub use session::{NegotiationPhase, PeerSnapshot};

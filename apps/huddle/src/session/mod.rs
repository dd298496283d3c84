pub mod negotiation;
pub mod registry;

pub use negotiation::{
    Negotiation, NegotiationError, NegotiationInput, NegotiationPhase, NegotiationUpdate,
    should_initiate, spawn_negotiation,
};
pub use registry::{Peer, PeerLink, PeerRegistry, PeerSnapshot, QualitySample};

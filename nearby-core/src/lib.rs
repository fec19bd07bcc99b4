//! Nearby peer discovery and profile exchange.
//! Host-driven: no I/O; host passes transport events and the engine drives an injected transport.

pub mod chunk;
pub mod config;
pub mod engine;
pub mod identity;
pub mod link;
pub mod mode;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use chunk::{
    decode_chunks, encode_chunks, encode_chunks_with_limit, ChunkError, DecodeStep, Framing,
    Reassembler,
};
pub use config::EngineConfig;
pub use engine::{DiscoveryEngine, RosterObserver};
pub use identity::{LocalProfile, PeerId, ProfileProvider};
pub use link::{FailureReason, LinkError, LinkState, ProtocolError};
pub use mode::{Mode, ParseModeError, Role};
pub use profile::{Avatar, Profile, ProfileAdapter, ProfileEncoding, ProfileError};
pub use protocol::PROTOCOL_VERSION;
pub use registry::{MergeOutcome, PresenceRegistry};
pub use transport::{RadioState, Transport, TransportError, TransportEvent};

//! Transport capability: the radio primitives the engine drives, and the events it consumes.

use std::fmt;

use uuid::Uuid;

use crate::identity::PeerId;

/// Power/authorization state reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    /// Sessions may be started (an unknown radio gets the benefit of the doubt).
    pub fn is_usable(self) -> bool {
        matches!(self, RadioState::Unknown | RadioState::PoweredOn)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RadioState::Unknown => "unknown",
            RadioState::Resetting => "resetting",
            RadioState::Unsupported => "unsupported",
            RadioState::Unauthorized => "unauthorized",
            RadioState::PoweredOff => "powered off",
            RadioState::PoweredOn => "powered on",
        };
        f.write_str(s)
    }
}

/// Radio primitives. Requests complete asynchronously through [`TransportEvent`]s.
pub trait Transport {
    fn start_advertising(&mut self, service: Uuid) -> Result<(), TransportError>;
    fn stop_advertising(&mut self);
    /// `None` scans for every service.
    fn start_scanning(&mut self, service: Option<Uuid>) -> Result<(), TransportError>;
    fn stop_scanning(&mut self);
    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError>;
    /// Cancel a pending or established outbound connection. Completion may never be reported.
    fn disconnect(&mut self, peer: &PeerId);
    fn discover_services(&mut self, peer: &PeerId, service: Uuid);
    fn discover_characteristics(&mut self, peer: &PeerId, service: Uuid, characteristic: Uuid);
    /// Enable notifications on the characteristic (initial read).
    fn subscribe(&mut self, peer: &PeerId, characteristic: Uuid);
    /// Notify one subscriber. `false` means the transmit queue is full: wait for
    /// [`TransportEvent::ReadyToSend`] and retry the same chunk.
    fn send_chunk(&mut self, peer: &PeerId, chunk: &[u8]) -> bool;
}

/// Callbacks from the radio, delivered serially to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(RadioState),
    PeerSighted {
        peer: PeerId,
        rssi: i16,
    },
    Connected(PeerId),
    ConnectFailed {
        peer: PeerId,
        reason: String,
    },
    /// An outbound connection dropped.
    Disconnected {
        peer: PeerId,
        reason: Option<String>,
    },
    ServiceDiscovered {
        peer: PeerId,
        result: Result<(), TransportError>,
    },
    CharacteristicDiscovered {
        peer: PeerId,
        result: Result<(), TransportError>,
    },
    ChunkReceived {
        peer: PeerId,
        chunk: Vec<u8>,
    },
    ReadyToSend(PeerId),
    BroadcastSubscribed(PeerId),
    BroadcastUnsubscribed(PeerId),
}

/// Radio-level failure. Recovered by tearing the link down and waiting for the next sighting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("radio unavailable ({0})")]
    Unavailable(RadioState),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("transfer service not found")]
    ServiceNotFound,
    #[error("transfer characteristic not found")]
    CharacteristicNotFound,
    #[error("link timed out")]
    TimedOut,
    #[error("{0}")]
    Other(String),
}

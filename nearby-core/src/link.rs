//! Per-peer link state machine and the transfer buffer it owns.
//!
//! Receiver: `Idle -> Connecting -> ConnectedDiscoveringServices ->
//! ConnectedDiscoveringCharacteristics -> Subscribed -> Transferring -> Completed`.
//! Broadcaster: created at `Subscribed` when a remote subscribes, then
//! `Transferring -> Completed` once the terminal marker is accepted by the transport.
//! Any state may drop to `Disconnected`; any live state may drop to `Failed`.

use std::fmt;
use std::time::{Duration, Instant};

use crate::chunk::{ChunkError, DecodeStep, Reassembler};
use crate::identity::PeerId;
use crate::mode::Role;
use crate::profile::ProfileError;
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Connecting,
    ConnectedDiscoveringServices,
    ConnectedDiscoveringCharacteristics,
    Subscribed,
    Transferring,
    Completed,
    Failed,
    Disconnected,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Completed | LinkState::Failed | LinkState::Disconnected
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::ConnectedDiscoveringServices => "discovering services",
            LinkState::ConnectedDiscoveringCharacteristics => "discovering characteristics",
            LinkState::Subscribed => "subscribed",
            LinkState::Transferring => "transferring",
            LinkState::Completed => "completed",
            LinkState::Failed => "failed",
            LinkState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Outbound chunk queue for one subscriber. Resumes from the exact chunk that was refused.
#[derive(Debug)]
pub struct Outbox {
    chunks: Vec<Vec<u8>>,
    next: usize,
    paused: bool,
}

/// Result of draining an [`Outbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// Transport refused chunk `next`; wait for readiness.
    Blocked { next: usize },
    /// Every chunk, terminator included, was accepted.
    Done,
}

impl Outbox {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            next: 0,
            paused: false,
        }
    }

    /// Send chunks in order until `send` refuses one or the queue is empty.
    pub fn drain(&mut self, mut send: impl FnMut(&[u8]) -> bool) -> SendProgress {
        while let Some(chunk) = self.chunks.get(self.next) {
            if !send(chunk) {
                self.paused = true;
                return SendProgress::Blocked { next: self.next };
            }
            self.next += 1;
        }
        self.paused = false;
        SendProgress::Done
    }

    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len() - self.next
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

#[derive(Debug)]
enum Transfer {
    None,
    Inbound(Reassembler),
    Outbound(Outbox),
}

/// One connection attempt with one peer in one role.
#[derive(Debug)]
pub struct Link {
    peer: PeerId,
    role: Role,
    state: LinkState,
    opened_at: Instant,
    transfer: Transfer,
}

impl Link {
    /// Receiver-side link for a freshly sighted peer.
    pub fn receiver(peer: PeerId, now: Instant) -> Self {
        Self {
            peer,
            role: Role::Receiver,
            state: LinkState::Idle,
            opened_at: now,
            transfer: Transfer::None,
        }
    }

    /// Broadcaster-side link for a remote that just subscribed.
    pub fn broadcaster(peer: PeerId, now: Instant) -> Self {
        Self {
            peer,
            role: Role::Broadcaster,
            state: LinkState::Subscribed,
            opened_at: now,
            transfer: Transfer::None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened_at)
    }

    pub fn outbox(&self) -> Option<&Outbox> {
        match &self.transfer {
            Transfer::Outbound(o) => Some(o),
            _ => None,
        }
    }

    /// Bytes buffered for the inbound transfer in progress.
    pub fn buffered(&self) -> usize {
        match &self.transfer {
            Transfer::Inbound(r) => r.received_len(),
            _ => 0,
        }
    }

    fn expect(&self, role: Role, allowed: &[LinkState], input: &'static str) -> Result<(), LinkError> {
        if self.role == role && allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LinkError::InvalidTransition {
                state: self.state,
                role: self.role,
                input,
            })
        }
    }

    fn enter(&mut self, state: LinkState) {
        tracing::trace!(peer = %self.peer, role = %self.role, from = %self.state, to = %state, "link transition");
        self.state = state;
        if state.is_terminal() {
            self.transfer = Transfer::None;
        }
    }

    pub fn begin_connect(&mut self) -> Result<(), LinkError> {
        self.expect(Role::Receiver, &[LinkState::Idle], "connect")?;
        self.enter(LinkState::Connecting);
        Ok(())
    }

    pub fn on_connected(&mut self) -> Result<(), LinkError> {
        self.expect(Role::Receiver, &[LinkState::Connecting], "connected")?;
        self.enter(LinkState::ConnectedDiscoveringServices);
        Ok(())
    }

    pub fn on_service_discovered(&mut self) -> Result<(), LinkError> {
        self.expect(
            Role::Receiver,
            &[LinkState::ConnectedDiscoveringServices],
            "service discovered",
        )?;
        self.enter(LinkState::ConnectedDiscoveringCharacteristics);
        Ok(())
    }

    /// Characteristic found and subscription issued. Takes a fresh transfer buffer.
    pub fn on_subscribed(&mut self, reassembler: Reassembler) -> Result<(), LinkError> {
        self.expect(
            Role::Receiver,
            &[LinkState::ConnectedDiscoveringCharacteristics],
            "subscribed",
        )?;
        self.transfer = Transfer::Inbound(reassembler);
        self.enter(LinkState::Subscribed);
        Ok(())
    }

    /// Feed an inbound chunk. Returns the payload exactly once, on the terminal marker.
    /// A codec error fails the link.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, LinkError> {
        self.expect(
            Role::Receiver,
            &[LinkState::Subscribed, LinkState::Transferring],
            "chunk",
        )?;
        let Transfer::Inbound(reassembler) = &mut self.transfer else {
            return Err(LinkError::InvalidTransition {
                state: self.state,
                role: self.role,
                input: "chunk",
            });
        };
        match reassembler.push(chunk) {
            Ok(DecodeStep::Continue) => {
                if self.state == LinkState::Subscribed {
                    self.enter(LinkState::Transferring);
                }
                Ok(None)
            }
            Ok(DecodeStep::Complete(payload)) => {
                self.enter(LinkState::Completed);
                Ok(Some(payload))
            }
            Err(e) => {
                self.enter(LinkState::Failed);
                Err(LinkError::Codec(e))
            }
        }
    }

    /// Queue the framed profile for a subscriber.
    pub fn start_send(&mut self, chunks: Vec<Vec<u8>>) -> Result<(), LinkError> {
        self.expect(Role::Broadcaster, &[LinkState::Subscribed], "send")?;
        self.transfer = Transfer::Outbound(Outbox::new(chunks));
        self.enter(LinkState::Transferring);
        Ok(())
    }

    /// Push queued chunks through `send`. Completes once the terminator is accepted.
    pub fn pump(&mut self, send: impl FnMut(&[u8]) -> bool) -> Result<SendProgress, LinkError> {
        self.expect(Role::Broadcaster, &[LinkState::Transferring], "ready to send")?;
        let Transfer::Outbound(outbox) = &mut self.transfer else {
            return Err(LinkError::InvalidTransition {
                state: self.state,
                role: self.role,
                input: "ready to send",
            });
        };
        let progress = outbox.drain(send);
        if progress == SendProgress::Done {
            self.enter(LinkState::Completed);
        }
        Ok(progress)
    }

    /// Any live state may fail.
    pub fn fail(&mut self) -> Result<(), LinkError> {
        if self.state.is_terminal() {
            return Err(LinkError::InvalidTransition {
                state: self.state,
                role: self.role,
                input: "fail",
            });
        }
        self.enter(LinkState::Failed);
        Ok(())
    }

    /// Connection gone, solicited or not. Returns the truncation if a transfer was cut short.
    pub fn disconnect(&mut self) -> Option<ChunkError> {
        let cut = match &self.transfer {
            Transfer::Inbound(r) if !r.is_complete() => r.finish().err(),
            _ => None,
        };
        if self.state != LinkState::Disconnected {
            self.enter(LinkState::Disconnected);
        }
        cut
    }
}

/// Why a link ended in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum FailureReason {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("out of sequence: {0}")]
    Sequence(#[from] LinkError),
}

/// Bad data from a peer. The data is discarded and the link torn down.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

/// Input the link cannot accept in its current state, or a codec failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("{role} link in state {state} cannot accept {input}")]
    InvalidTransition {
        state: LinkState,
        role: Role,
        input: &'static str,
    },
    #[error(transparent)]
    Codec(#[from] ChunkError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{encode_chunks, Framing};

    fn peer() -> PeerId {
        PeerId::new("P")
    }

    fn subscribed_receiver() -> Link {
        let mut link = Link::receiver(peer(), Instant::now());
        link.begin_connect().unwrap();
        link.on_connected().unwrap();
        link.on_service_discovered().unwrap();
        link.on_subscribed(Reassembler::new(Framing::EomMarker, 20)).unwrap();
        link
    }

    #[test]
    fn receiver_happy_path() {
        let mut link = subscribed_receiver();
        assert_eq!(link.state(), LinkState::Subscribed);
        assert_eq!(link.on_chunk(b"hello ").unwrap(), None);
        assert_eq!(link.state(), LinkState::Transferring);
        assert_eq!(link.buffered(), 6);
        assert_eq!(link.on_chunk(b"world").unwrap(), None);
        assert_eq!(
            link.on_chunk(b"EOM").unwrap(),
            Some(b"hello world".to_vec())
        );
        assert_eq!(link.state(), LinkState::Completed);
        assert_eq!(link.buffered(), 0);
        // Nothing after completion.
        assert!(link.on_chunk(b"x").is_err());
    }

    #[test]
    fn out_of_order_inputs_rejected() {
        let mut link = Link::receiver(peer(), Instant::now());
        assert!(matches!(
            link.on_connected(),
            Err(LinkError::InvalidTransition {
                state: LinkState::Idle,
                ..
            })
        ));
        link.begin_connect().unwrap();
        assert!(link.on_chunk(b"early").is_err());
        assert!(link.begin_connect().is_err());
    }

    #[test]
    fn codec_error_fails_link() {
        let mut link = subscribed_receiver();
        let err = link.on_chunk(&[0u8; 21]).unwrap_err();
        assert!(matches!(err, LinkError::Codec(ChunkError::ChunkTooLarge { .. })));
        assert_eq!(link.state(), LinkState::Failed);
        assert!(link.fail().is_err());
    }

    #[test]
    fn disconnect_mid_transfer_reports_truncation() {
        let mut link = subscribed_receiver();
        link.on_chunk(b"half").unwrap();
        let cut = link.disconnect().unwrap();
        assert!(cut.is_truncation());
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(link.buffered(), 0);
        assert!(link.disconnect().is_none());
    }

    #[test]
    fn broadcaster_pauses_and_resumes_at_refused_chunk() {
        let chunks = encode_chunks(&[9u8; 80], 20, Framing::EomMarker).unwrap();
        assert_eq!(chunks.len(), 5);
        let mut link = Link::broadcaster(peer(), Instant::now());
        link.start_send(chunks.clone()).unwrap();

        let mut sent: Vec<Vec<u8>> = Vec::new();
        let mut calls = 0;
        let progress = link
            .pump(|c| {
                calls += 1;
                if calls == 3 {
                    return false;
                }
                sent.push(c.to_vec());
                true
            })
            .unwrap();
        assert_eq!(progress, SendProgress::Blocked { next: 2 });
        assert!(link.outbox().unwrap().is_paused());
        assert_eq!(link.outbox().unwrap().remaining(), 3);
        assert_eq!(link.outbox().unwrap().next_index(), 2);
        assert_eq!(link.state(), LinkState::Transferring);

        let progress = link
            .pump(|c| {
                sent.push(c.to_vec());
                true
            })
            .unwrap();
        assert_eq!(progress, SendProgress::Done);
        assert_eq!(link.state(), LinkState::Completed);
        assert_eq!(sent, chunks);
    }

    #[test]
    fn broadcaster_cannot_receive() {
        let mut link = Link::broadcaster(peer(), Instant::now());
        assert!(link.on_chunk(b"x").is_err());
        assert!(link.pump(|_| true).is_err());
    }
}

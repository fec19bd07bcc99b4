//! Discovery engine: owns the mode, the link arena and the roster.
//!
//! Host passes transport events (with the current time); the engine drives the injected
//! [`Transport`] and reports roster changes to subscribed observers. Events for one engine
//! must be delivered serially.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::chunk::{encode_chunks_with_limit, Reassembler};
use crate::config::EngineConfig;
use crate::identity::{PeerId, ProfileProvider};
use crate::link::{FailureReason, Link, LinkError, LinkState, ProtocolError, SendProgress};
use crate::mode::{Mode, Role};
use crate::profile::{Profile, ProfileAdapter};
use crate::registry::PresenceRegistry;
use crate::transport::{RadioState, Transport, TransportError, TransportEvent};

/// Receives the full roster after every observable change.
pub trait RosterObserver {
    fn on_roster_changed(&mut self, roster: &[Profile]);
}

impl<F: FnMut(&[Profile])> RosterObserver for F {
    fn on_roster_changed(&mut self, roster: &[Profile]) {
        self(roster)
    }
}

type LinkKey = (Role, PeerId);

/// Dual-role discovery coordinator.
pub struct DiscoveryEngine<T, P> {
    config: EngineConfig,
    local_id: PeerId,
    transport: T,
    profiles: P,
    adapter: ProfileAdapter,
    /// Requested mode.
    mode: Mode,
    /// Sessions actually running on the transport.
    sessions: Mode,
    radio: RadioState,
    links: HashMap<LinkKey, Link>,
    /// RSSI recorded at sighting, kept while the peer's receiver link lives.
    signal: HashMap<PeerId, i16>,
    registry: PresenceRegistry,
    observers: Vec<Box<dyn RosterObserver + Send>>,
}

impl<T: Transport, P: ProfileProvider> DiscoveryEngine<T, P> {
    /// `local_id` is what this device advertises; sightings of it are ignored.
    pub fn new(config: EngineConfig, local_id: PeerId, transport: T, profiles: P) -> Self {
        let adapter = ProfileAdapter::new(config.profile_encoding);
        Self {
            config,
            local_id,
            transport,
            profiles,
            adapter,
            mode: Mode::OFF,
            sessions: Mode::OFF,
            radio: RadioState::Unknown,
            links: HashMap::new(),
            signal: HashMap::new(),
            registry: PresenceRegistry::new(),
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, observer: impl RosterObserver + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Sessions currently running; lags `mode()` while the radio is unusable.
    pub fn active_sessions(&self) -> Mode {
        self.sessions
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn link_state(&self, role: Role, peer: &PeerId) -> Option<LinkState> {
        self.links
            .get(&(role, peer.clone()))
            .map(|link| link.state())
    }

    /// Number of live links across both roles.
    pub fn live_links(&self) -> usize {
        self.links.len()
    }

    pub fn roster(&self) -> Vec<Profile> {
        self.registry.snapshot()
    }

    /// Apply a new mode: start sessions for bits turning on, stop sessions and tear down
    /// links for bits turning off. Setting the current mode again does nothing.
    pub fn set_mode(&mut self, requested: Mode) {
        if requested == self.mode {
            debug!(mode = %requested, "mode unchanged");
            return;
        }
        let stopping = self.mode.difference(requested);
        info!(from = %self.mode, to = %requested, "mode changed");
        self.mode = requested;

        if stopping.is_receiving() {
            if self.sessions.is_receiving() {
                self.transport.stop_scanning();
                self.sessions = self.sessions.difference(Mode::RECEIVING);
                info!("scanning stopped");
            }
            self.teardown_role(Role::Receiver, true);
            if self.registry.clear() {
                self.notify();
            }
        }
        if stopping.is_broadcasting() {
            if self.sessions.is_broadcasting() {
                self.transport.stop_advertising();
                self.sessions = self.sessions.difference(Mode::BROADCASTING);
                info!("advertising stopped");
            }
            self.teardown_role(Role::Broadcaster, true);
        }
        self.start_sessions();
    }

    /// Dispatch one transport event.
    pub fn handle(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::StateChanged(state) => self.on_state_changed(state),
            TransportEvent::PeerSighted { peer, rssi } => self.on_peer_sighted(peer, rssi, now),
            TransportEvent::Connected(peer) => self.on_connected(&peer),
            TransportEvent::ConnectFailed { peer, reason } => self.on_connect_failed(&peer, &reason),
            TransportEvent::Disconnected { peer, reason } => {
                self.on_disconnected(&peer, reason.as_deref())
            }
            TransportEvent::ServiceDiscovered { peer, result } => {
                self.on_service_discovered(&peer, result)
            }
            TransportEvent::CharacteristicDiscovered { peer, result } => {
                self.on_characteristic_discovered(&peer, result)
            }
            TransportEvent::ChunkReceived { peer, chunk } => {
                self.on_chunk_received(&peer, &chunk, now)
            }
            TransportEvent::ReadyToSend(peer) => self.on_ready_to_send(&peer),
            TransportEvent::BroadcastSubscribed(peer) => self.on_broadcast_requested(peer, now),
            TransportEvent::BroadcastUnsubscribed(peer) => self.on_broadcast_unsubscribed(&peer),
        }
    }

    pub fn on_state_changed(&mut self, state: RadioState) {
        let previous = self.radio;
        if state == previous {
            return;
        }
        self.radio = state;
        info!(from = %previous, to = %state, "radio state changed");
        if state.is_usable() {
            self.start_sessions();
            return;
        }
        // Sessions died with the radio; forget links without waiting for confirmations.
        self.sessions = Mode::OFF;
        self.teardown_role(Role::Receiver, false);
        self.teardown_role(Role::Broadcaster, false);
    }

    /// A scan result. Connects unless the peer is us or already has a receiver link.
    pub fn on_peer_sighted(&mut self, peer: PeerId, rssi: i16, now: Instant) {
        if !self.mode.is_receiving() {
            trace!(peer = %peer, "sighting while not receiving");
            return;
        }
        if peer == self.local_id {
            trace!("ignoring own advertisement");
            return;
        }
        let key = (Role::Receiver, peer.clone());
        if self.links.contains_key(&key) {
            trace!(peer = %peer, rssi, "already linked");
            return;
        }
        self.signal.insert(peer.clone(), rssi);

        let mut link = Link::receiver(peer.clone(), now);
        if let Err(e) = link.begin_connect() {
            warn!(peer = %peer, error = %e, "cannot start link");
            return;
        }
        debug!(peer = %peer, rssi, "peer sighted, connecting");
        self.links.insert(key.clone(), link);
        if let Err(e) = self.transport.connect(&peer) {
            self.fail_link(key, e.into());
        }
    }

    pub fn on_connected(&mut self, peer: &PeerId) {
        let key = (Role::Receiver, peer.clone());
        let Some(link) = self.links.get_mut(&key) else {
            trace!(peer = %peer, "stale connect");
            return;
        };
        match link.on_connected() {
            Ok(()) => self.transport.discover_services(peer, self.config.service_uuid),
            Err(e) => self.fail_link(key, e.into()),
        }
    }

    pub fn on_connect_failed(&mut self, peer: &PeerId, reason: &str) {
        let key = (Role::Receiver, peer.clone());
        if !self.links.contains_key(&key) {
            trace!(peer = %peer, "stale connect failure");
            return;
        }
        self.fail_link(
            key,
            FailureReason::Transport(TransportError::ConnectFailed(reason.to_owned())),
        );
    }

    /// Unsolicited disconnect of an outbound connection. Subscribers leave through
    /// [`on_broadcast_unsubscribed`](Self::on_broadcast_unsubscribed) instead.
    ///
    /// A connection that never opened ends with `ConnectFailed`, so a disconnect while
    /// `Connecting` is the late confirmation of an earlier link's teardown.
    pub fn on_disconnected(&mut self, peer: &PeerId, reason: Option<&str>) {
        let key = (Role::Receiver, peer.clone());
        match self.links.get(&key).map(|link| link.state()) {
            None => {
                trace!(peer = %peer, "stale disconnect");
                return;
            }
            Some(LinkState::Connecting) => {
                trace!(peer = %peer, "late disconnect while connecting");
                return;
            }
            Some(_) => {}
        }
        let Some(mut link) = self.links.remove(&key) else {
            return;
        };
        self.signal.remove(peer);
        match link.disconnect() {
            Some(cut) => warn!(peer = %peer, error = %cut, "transfer cut short"),
            None => debug!(peer = %peer, reason = ?reason, "peer disconnected"),
        }
        self.rearm_scan();
    }

    pub fn on_service_discovered(&mut self, peer: &PeerId, result: Result<(), TransportError>) {
        let key = (Role::Receiver, peer.clone());
        let Some(link) = self.links.get_mut(&key) else {
            trace!(peer = %peer, "stale service discovery");
            return;
        };
        if let Err(e) = result {
            self.fail_link(key, e.into());
            return;
        }
        match link.on_service_discovered() {
            Ok(()) => self.transport.discover_characteristics(
                peer,
                self.config.service_uuid,
                self.config.characteristic_uuid,
            ),
            Err(e) => self.fail_link(key, e.into()),
        }
    }

    pub fn on_characteristic_discovered(
        &mut self,
        peer: &PeerId,
        result: Result<(), TransportError>,
    ) {
        let key = (Role::Receiver, peer.clone());
        let Some(link) = self.links.get_mut(&key) else {
            trace!(peer = %peer, "stale characteristic discovery");
            return;
        };
        if let Err(e) = result {
            self.fail_link(key, e.into());
            return;
        }
        let reassembler = Reassembler::with_limit(
            self.config.framing,
            self.config.chunk_size,
            self.config.max_payload_len,
        );
        match link.on_subscribed(reassembler) {
            Ok(()) => {
                self.transport.subscribe(peer, self.config.characteristic_uuid);
                debug!(peer = %peer, "subscribed to profile");
            }
            Err(e) => self.fail_link(key, e.into()),
        }
    }

    pub fn on_chunk_received(&mut self, peer: &PeerId, chunk: &[u8], now: Instant) {
        let key = (Role::Receiver, peer.clone());
        let Some(link) = self.links.get_mut(&key) else {
            trace!(peer = %peer, len = chunk.len(), "chunk for unknown link");
            return;
        };
        trace!(peer = %peer, len = chunk.len(), "chunk received");
        match link.on_chunk(chunk) {
            Ok(None) => {}
            Ok(Some(payload)) => {
                debug!(peer = %peer, len = payload.len(), "transfer complete");
                let rssi = self.signal.get(peer).copied().unwrap_or_default();
                self.release(key);
                self.merge_payload(peer, &payload, rssi, now);
            }
            Err(LinkError::Codec(e)) => self.fail_link(key, ProtocolError::from(e).into()),
            Err(e) => self.fail_link(key, e.into()),
        }
    }

    /// Decode a reassembled payload and merge it. Undecodable payloads are dropped.
    pub fn on_profile_received(&mut self, peer: &PeerId, payload: &[u8], now: Instant) {
        let rssi = self.signal.get(peer).copied().unwrap_or_default();
        self.merge_payload(peer, payload, rssi, now);
    }

    fn merge_payload(&mut self, peer: &PeerId, payload: &[u8], rssi: i16, now: Instant) {
        let profile = match self.adapter.decode(payload, rssi, now) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %peer, error = %e, "discarding undecodable profile");
                return;
            }
        };
        let outcome = self.registry.merge(profile, now);
        debug!(peer = %peer, ?outcome, "profile merged");
        if outcome.changed() {
            self.notify();
        }
    }

    /// A remote subscribed to our profile: encode it for that peer and start streaming.
    /// A repeated subscription restarts the transfer from the first chunk.
    pub fn on_broadcast_requested(&mut self, peer: PeerId, now: Instant) {
        if !self.mode.is_broadcasting() {
            trace!(peer = %peer, "subscription while not broadcasting");
            return;
        }
        let key = (Role::Broadcaster, peer.clone());
        if let Some(mut old) = self.links.remove(&key) {
            debug!(peer = %peer, state = %old.state(), "restarting transfer");
            old.disconnect();
        }
        let mut link = Link::broadcaster(peer.clone(), now);

        let chunks = self
            .adapter
            .encode_for_peer(&self.profiles, &peer)
            .map_err(ProtocolError::from)
            .and_then(|bytes| {
                encode_chunks_with_limit(
                    &bytes,
                    self.config.chunk_size,
                    self.config.framing,
                    self.config.max_payload_len,
                )
                .map_err(ProtocolError::from)
            });
        let chunks = match chunks {
            Ok(c) => c,
            Err(e) => {
                self.links.insert(key.clone(), link);
                self.fail_link(key, e.into());
                return;
            }
        };
        debug!(peer = %peer, chunks = chunks.len(), "sending profile");
        if let Err(e) = link.start_send(chunks) {
            warn!(peer = %peer, error = %e, "cannot start send");
            return;
        }
        self.links.insert(key.clone(), link);
        self.pump(key);
    }

    /// Transport drained its queue: resume from the refused chunk.
    pub fn on_ready_to_send(&mut self, peer: &PeerId) {
        let key = (Role::Broadcaster, peer.clone());
        match self.links.get(&key) {
            Some(link) if link.state() == LinkState::Transferring => self.pump(key),
            _ => trace!(peer = %peer, "ready with nothing to send"),
        }
    }

    pub fn on_broadcast_unsubscribed(&mut self, peer: &PeerId) {
        match self.links.remove(&(Role::Broadcaster, peer.clone())) {
            Some(mut link) => {
                debug!(peer = %peer, state = %link.state(), "subscriber left");
                link.disconnect();
            }
            None => trace!(peer = %peer, "unsubscribe from unknown subscriber"),
        }
    }

    /// Periodic housekeeping: invalidation sweep and the optional link timeout.
    pub fn tick(&mut self, now: Instant) {
        if self.registry.sweep(now, self.config.invalidation_window()) {
            debug!(remaining = self.registry.len(), "stale peers swept");
            self.notify();
        }
        let Some(timeout) = self.config.link_timeout() else {
            return;
        };
        let expired: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|((role, _), link)| *role == Role::Receiver && link.age(now) > timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.fail_link(key, TransportError::TimedOut.into());
        }
    }

    fn start_sessions(&mut self) {
        if !self.radio.is_usable() {
            debug!(radio = %self.radio, "radio unusable, sessions deferred");
            return;
        }
        let missing = self.mode.difference(self.sessions);
        if missing.is_broadcasting() {
            match self.transport.start_advertising(self.config.service_uuid) {
                Ok(()) => {
                    self.sessions = self.sessions.union(Mode::BROADCASTING);
                    info!(service = %self.config.service_uuid, "advertising started");
                }
                Err(e) => warn!(error = %e, "failed to start advertising"),
            }
        }
        if missing.is_receiving() {
            match self.transport.start_scanning(Some(self.config.service_uuid)) {
                Ok(()) => {
                    self.sessions = self.sessions.union(Mode::RECEIVING);
                    info!(service = %self.config.service_uuid, "scanning started");
                }
                Err(e) => warn!(error = %e, "failed to start scanning"),
            }
        }
    }

    /// Receiver link ended: make sure the scan is running again.
    fn rearm_scan(&mut self) {
        if !self.mode.is_receiving() || !self.radio.is_usable() {
            return;
        }
        match self.transport.start_scanning(Some(self.config.service_uuid)) {
            Ok(()) => self.sessions = self.sessions.union(Mode::RECEIVING),
            Err(e) => warn!(error = %e, "failed to restart scanning"),
        }
    }

    fn pump(&mut self, key: LinkKey) {
        let Some(link) = self.links.get_mut(&key) else {
            return;
        };
        let transport = &mut self.transport;
        let peer = key.1.clone();
        match link.pump(|chunk| transport.send_chunk(&peer, chunk)) {
            Ok(SendProgress::Blocked { next }) => {
                debug!(peer = %peer, next, "transport busy, send paused")
            }
            Ok(SendProgress::Done) => {
                info!(peer = %peer, "profile sent");
                self.release(key);
            }
            Err(e) => warn!(peer = %peer, error = %e, "cannot send"),
        }
    }

    fn fail_link(&mut self, key: LinkKey, reason: FailureReason) {
        let Some(link) = self.links.get_mut(&key) else {
            return;
        };
        warn!(peer = %key.1, role = %key.0, state = %link.state(), error = %reason, "link failed");
        if !link.state().is_terminal() {
            // Only errors when already terminal, checked above.
            let _ = link.fail();
        }
        self.release(key);
    }

    /// Remove a finished link. Receiver links also drop their transport connection;
    /// a broadcaster has no connection of its own to drop.
    fn release(&mut self, key: LinkKey) {
        let Some(mut link) = self.links.remove(&key) else {
            return;
        };
        let (role, peer) = key;
        link.disconnect();
        debug!(peer = %peer, %role, "link released");
        if role == Role::Receiver {
            self.signal.remove(&peer);
            self.transport.disconnect(&peer);
            self.rearm_scan();
        }
    }

    /// Forget every link in `role`. `disconnect` also cancels receiver connections.
    fn teardown_role(&mut self, role: Role, disconnect: bool) {
        let keys: Vec<LinkKey> = self
            .links
            .keys()
            .filter(|(r, _)| *r == role)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut link) = self.links.remove(&key) {
                if role == Role::Receiver {
                    self.signal.remove(&key.1);
                    if disconnect {
                        self.transport.disconnect(&key.1);
                    }
                }
                link.disconnect();
                debug!(peer = %key.1, %role, "link torn down");
            }
        }
    }

    fn notify(&mut self) {
        let roster = self.registry.snapshot();
        info!(peers = roster.len(), "roster changed");
        for observer in &mut self.observers {
            observer.on_roster_changed(&roster);
        }
    }
}

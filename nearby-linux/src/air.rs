//! Emulated radio on the LAN: UDP multicast adverts plus unicast GATT-like datagrams.
//!
//! [`UdpTransport`] is the engine-facing half; it only queues work. [`Radio`] owns the
//! sockets, runs as its own task and posts [`TransportEvent`]s back to the device loop.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nearby_core::{PeerId, RadioState, Transport, TransportError, TransportEvent};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
/// Connect attempts with no answer are reported failed after this long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// No real signal on a LAN.
const EMULATED_RSSI: i16 = -50;
const MAX_DATAGRAM: usize = 65536;

/// One datagram on the emulated air.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AirFrame {
    /// Multicast while advertising.
    Advert {
        peer: PeerId,
        service: Uuid,
        listen_port: u16,
    },
    Connect {
        from: PeerId,
    },
    Accept {
        from: PeerId,
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
    },
    Reject {
        from: PeerId,
        reason: String,
    },
    Subscribe {
        from: PeerId,
        characteristic: Uuid,
    },
    Notify {
        from: PeerId,
        chunk: Vec<u8>,
    },
    /// Central leaves a peripheral.
    Unsubscribe {
        from: PeerId,
    },
    /// Peripheral stopped advertising and dropped its centrals.
    Disconnect {
        from: PeerId,
    },
}

impl AirFrame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug)]
enum Command {
    StartAdvertising(Uuid),
    StopAdvertising,
    StartScanning(Option<Uuid>),
    StopScanning,
    Connect(PeerId),
    Disconnect(PeerId),
    DiscoverServices(PeerId, Uuid),
    DiscoverCharacteristics(PeerId, Uuid, Uuid),
    Subscribe(PeerId, Uuid),
}

/// Peers whose last notify was refused, waiting for a readiness event.
type Blocked = Arc<Mutex<HashSet<PeerId>>>;

fn lock(blocked: &Blocked) -> std::sync::MutexGuard<'_, HashSet<PeerId>> {
    blocked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Engine-side handle. Every call is non-blocking.
pub struct UdpTransport {
    commands: mpsc::UnboundedSender<Command>,
    notify: mpsc::Sender<(PeerId, Vec<u8>)>,
    blocked: Blocked,
}

impl UdpTransport {
    fn command(&self, cmd: Command) -> Result<(), TransportError> {
        self.commands
            .send(cmd)
            .map_err(|_| TransportError::Unavailable(RadioState::PoweredOff))
    }

    fn post(&self, cmd: Command) {
        if self.command(cmd).is_err() {
            trace!("radio gone, command dropped");
        }
    }
}

impl Transport for UdpTransport {
    fn start_advertising(&mut self, service: Uuid) -> Result<(), TransportError> {
        self.command(Command::StartAdvertising(service))
    }

    fn stop_advertising(&mut self) {
        self.post(Command::StopAdvertising);
    }

    fn start_scanning(&mut self, service: Option<Uuid>) -> Result<(), TransportError> {
        self.command(Command::StartScanning(service))
    }

    fn stop_scanning(&mut self) {
        self.post(Command::StopScanning);
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.command(Command::Connect(peer.clone()))
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.post(Command::Disconnect(peer.clone()));
    }

    fn discover_services(&mut self, peer: &PeerId, service: Uuid) {
        self.post(Command::DiscoverServices(peer.clone(), service));
    }

    fn discover_characteristics(&mut self, peer: &PeerId, service: Uuid, characteristic: Uuid) {
        self.post(Command::DiscoverCharacteristics(
            peer.clone(),
            service,
            characteristic,
        ));
    }

    fn subscribe(&mut self, peer: &PeerId, characteristic: Uuid) {
        self.post(Command::Subscribe(peer.clone(), characteristic));
    }

    fn send_chunk(&mut self, peer: &PeerId, chunk: &[u8]) -> bool {
        // Mark first so a drain racing with a full queue still wakes us.
        lock(&self.blocked).insert(peer.clone());
        match self.notify.try_send((peer.clone(), chunk.to_vec())) {
            Ok(()) => {
                lock(&self.blocked).remove(peer);
                true
            }
            Err(TrySendError::Full(_)) => {
                trace!(peer = %peer, "notify queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                lock(&self.blocked).remove(peer);
                warn!(peer = %peer, "radio gone, chunk dropped");
                false
            }
        }
    }
}

/// What a connected peripheral offered in its accept.
#[derive(Debug)]
struct Remote {
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
}

/// Socket-owning half of the emulated radio.
pub struct Radio {
    local: PeerId,
    characteristic: Uuid,
    multicast: UdpSocket,
    unicast: UdpSocket,
    group: SocketAddr,
    advert_interval: Duration,
    advertising: Option<Uuid>,
    /// `Some(filter)` while scanning.
    scanning: Option<Option<Uuid>>,
    addrs: HashMap<PeerId, SocketAddr>,
    pending: HashMap<PeerId, Instant>,
    remotes: HashMap<PeerId, Remote>,
    subscribers: HashSet<PeerId>,
    blocked: Blocked,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    notify: mpsc::Receiver<(PeerId, Vec<u8>)>,
}

pub struct RadioConfig {
    pub discovery_port: u16,
    pub advert_interval: Duration,
    pub notify_queue: usize,
    pub characteristic: Uuid,
}

/// Bind the sockets and split the radio into its transport handle and its task.
pub async fn bind(
    local: PeerId,
    config: RadioConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<(UdpTransport, Radio)> {
    let multicast = make_multicast_socket(config.discovery_port)?;
    let unicast = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    Ok(split(local, &config, multicast, unicast, events))
}

fn split(
    local: PeerId,
    config: &RadioConfig,
    multicast: UdpSocket,
    unicast: UdpSocket,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> (UdpTransport, Radio) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::channel(config.notify_queue.max(1));
    let blocked: Blocked = Arc::default();
    let transport = UdpTransport {
        commands: command_tx,
        notify: notify_tx,
        blocked: blocked.clone(),
    };
    let radio = Radio {
        local,
        characteristic: config.characteristic,
        multicast,
        unicast,
        group: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, config.discovery_port)),
        advert_interval: config.advert_interval,
        advertising: None,
        scanning: None,
        addrs: HashMap::new(),
        pending: HashMap::new(),
        remotes: HashMap::new(),
        subscribers: HashSet::new(),
        blocked,
        events,
        commands: command_rx,
        notify: notify_rx,
    };
    (transport, radio)
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

impl Radio {
    /// Run until the transport handle is dropped.
    pub async fn run(mut self) -> std::io::Result<()> {
        let listen_port = self.unicast.local_addr()?.port();
        info!(group = %self.group, listen_port, "radio up");
        self.post(TransportEvent::StateChanged(RadioState::PoweredOn));

        let mut adverts = tokio::time::interval(self.advert_interval);
        let mut mbuf = vec![0u8; MAX_DATAGRAM];
        let mut ubuf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                biased;
                Some((peer, chunk)) = self.notify.recv() => self.send_notify(peer, chunk).await,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.execute(cmd, listen_port).await,
                    None => break,
                },
                res = self.unicast.recv_from(&mut ubuf) => {
                    let (n, from) = res?;
                    self.on_unicast(&ubuf[..n], from).await;
                }
                res = self.multicast.recv_from(&mut mbuf) => {
                    let (n, from) = res?;
                    self.on_multicast(&mbuf[..n], from);
                }
                _ = adverts.tick() => self.on_interval(listen_port).await,
            }
        }
        debug!("radio down");
        Ok(())
    }

    fn post(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("device loop gone, event dropped");
        }
    }

    async fn send_to(&self, frame: &AirFrame, addr: SocketAddr) {
        let bytes = match frame.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "cannot encode frame");
                return;
            }
        };
        if let Err(e) = self.unicast.send_to(&bytes, addr).await {
            debug!(%addr, error = %e, "send failed");
        }
    }

    async fn send_to_peer(&self, frame: &AirFrame, peer: &PeerId) -> bool {
        match self.addrs.get(peer) {
            Some(addr) => {
                self.send_to(frame, *addr).await;
                true
            }
            None => false,
        }
    }

    async fn advertise(&self, service: Uuid, listen_port: u16) {
        let frame = AirFrame::Advert {
            peer: self.local.clone(),
            service,
            listen_port,
        };
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.multicast.send_to(&bytes, self.group).await {
                    debug!(error = %e, "advert failed");
                }
            }
            Err(e) => warn!(error = %e, "cannot encode advert"),
        }
    }

    async fn execute(&mut self, cmd: Command, listen_port: u16) {
        trace!(?cmd, "radio command");
        match cmd {
            Command::StartAdvertising(service) => {
                self.advertising = Some(service);
                self.advertise(service, listen_port).await;
            }
            Command::StopAdvertising => {
                self.advertising = None;
                let frame = AirFrame::Disconnect {
                    from: self.local.clone(),
                };
                let centrals: Vec<PeerId> = self.subscribers.drain().collect();
                for central in centrals {
                    self.send_to_peer(&frame, &central).await;
                }
            }
            Command::StartScanning(filter) => self.scanning = Some(filter),
            Command::StopScanning => self.scanning = None,
            Command::Connect(peer) => {
                let frame = AirFrame::Connect {
                    from: self.local.clone(),
                };
                if self.send_to_peer(&frame, &peer).await {
                    self.pending.insert(peer, Instant::now() + CONNECT_TIMEOUT);
                } else {
                    self.post(TransportEvent::ConnectFailed {
                        peer,
                        reason: "no known address".into(),
                    });
                }
            }
            Command::Disconnect(peer) => {
                let was_pending = self.pending.remove(&peer).is_some();
                if self.remotes.remove(&peer).is_some() || was_pending {
                    let frame = AirFrame::Unsubscribe {
                        from: self.local.clone(),
                    };
                    self.send_to_peer(&frame, &peer).await;
                }
            }
            Command::DiscoverServices(peer, service) => {
                let result = match self.remotes.get(&peer) {
                    Some(r) if r.services.contains(&service) => Ok(()),
                    Some(_) => Err(TransportError::ServiceNotFound),
                    None => Err(TransportError::Disconnected("not connected".into())),
                };
                self.post(TransportEvent::ServiceDiscovered { peer, result });
            }
            Command::DiscoverCharacteristics(peer, service, characteristic) => {
                let result = match self.remotes.get(&peer) {
                    Some(r) if !r.services.contains(&service) => Err(TransportError::ServiceNotFound),
                    Some(r) if r.characteristics.contains(&characteristic) => Ok(()),
                    Some(_) => Err(TransportError::CharacteristicNotFound),
                    None => Err(TransportError::Disconnected("not connected".into())),
                };
                self.post(TransportEvent::CharacteristicDiscovered { peer, result });
            }
            Command::Subscribe(peer, characteristic) => {
                if self.remotes.contains_key(&peer) {
                    let frame = AirFrame::Subscribe {
                        from: self.local.clone(),
                        characteristic,
                    };
                    self.send_to_peer(&frame, &peer).await;
                }
            }
        }
    }

    fn on_multicast(&mut self, bytes: &[u8], from: SocketAddr) {
        let Ok(AirFrame::Advert {
            peer,
            service,
            listen_port,
        }) = AirFrame::decode(bytes)
        else {
            trace!(%from, "ignoring multicast datagram");
            return;
        };
        self.addrs
            .insert(peer.clone(), SocketAddr::new(from.ip(), listen_port));
        match self.scanning {
            Some(filter) if filter.map_or(true, |f| f == service) => {
                self.post(TransportEvent::PeerSighted {
                    peer,
                    rssi: EMULATED_RSSI,
                });
            }
            _ => {}
        }
    }

    async fn on_unicast(&mut self, bytes: &[u8], from: SocketAddr) {
        let frame = match AirFrame::decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                debug!(%from, error = %e, "undecodable datagram");
                return;
            }
        };
        match frame {
            AirFrame::Connect { from: central } => {
                self.addrs.insert(central.clone(), from);
                let reply = match self.advertising {
                    Some(service) => AirFrame::Accept {
                        from: self.local.clone(),
                        services: vec![service],
                        characteristics: vec![self.characteristic],
                    },
                    None => AirFrame::Reject {
                        from: self.local.clone(),
                        reason: "not advertising".into(),
                    },
                };
                self.send_to(&reply, from).await;
            }
            AirFrame::Accept {
                from: peer,
                services,
                characteristics,
            } => {
                if self.pending.remove(&peer).is_some() {
                    self.remotes.insert(
                        peer.clone(),
                        Remote {
                            services,
                            characteristics,
                        },
                    );
                    self.post(TransportEvent::Connected(peer));
                } else {
                    trace!(peer = %peer, "accept for no pending connect");
                }
            }
            AirFrame::Reject { from: peer, reason } => {
                if self.pending.remove(&peer).is_some() {
                    self.post(TransportEvent::ConnectFailed { peer, reason });
                }
            }
            AirFrame::Subscribe {
                from: central,
                characteristic,
            } => {
                if self.advertising.is_some() && characteristic == self.characteristic {
                    self.addrs.insert(central.clone(), from);
                    self.subscribers.insert(central.clone());
                    self.post(TransportEvent::BroadcastSubscribed(central));
                } else {
                    trace!(peer = %central, "subscribe refused");
                }
            }
            AirFrame::Notify { from: peer, chunk } => {
                if self.remotes.contains_key(&peer) {
                    self.post(TransportEvent::ChunkReceived { peer, chunk });
                } else {
                    trace!(peer = %peer, "notify on no connection");
                }
            }
            AirFrame::Unsubscribe { from: central } => {
                if self.subscribers.remove(&central) {
                    self.post(TransportEvent::BroadcastUnsubscribed(central));
                }
            }
            AirFrame::Disconnect { from: peer } => {
                if self.pending.remove(&peer).is_some() {
                    self.post(TransportEvent::ConnectFailed {
                        peer,
                        reason: "peer stopped advertising".into(),
                    });
                } else if self.remotes.remove(&peer).is_some() {
                    self.post(TransportEvent::Disconnected {
                        peer,
                        reason: Some("peer stopped advertising".into()),
                    });
                }
            }
            AirFrame::Advert { .. } => trace!(%from, "advert on unicast socket"),
        }
    }

    async fn send_notify(&mut self, peer: PeerId, chunk: Vec<u8>) {
        if self.subscribers.contains(&peer) {
            let frame = AirFrame::Notify {
                from: self.local.clone(),
                chunk,
            };
            self.send_to_peer(&frame, &peer).await;
        } else {
            trace!(peer = %peer, "dropping notify for departed subscriber");
        }
        let woken: Vec<PeerId> = lock(&self.blocked).drain().collect();
        for peer in woken {
            self.post(TransportEvent::ReadyToSend(peer));
        }
    }

    async fn on_interval(&mut self, listen_port: u16) {
        if let Some(service) = self.advertising {
            self.advertise(service, listen_port).await;
        }
        let now = Instant::now();
        let expired: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in expired {
            self.pending.remove(&peer);
            self.post(TransportEvent::ConnectFailed {
                peer,
                reason: "timed out".into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_roundtrip() {
        let frame = AirFrame::Accept {
            from: PeerId::new("A"),
            services: vec![nearby_core::protocol::TRANSFER_SERVICE_UUID],
            characteristics: vec![nearby_core::protocol::TRANSFER_CHARACTERISTIC_UUID],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(AirFrame::decode(&bytes).unwrap(), frame);
        assert!(AirFrame::decode(&[0xff; 3]).is_err());
    }

    #[test]
    fn full_queue_refuses_and_marks_blocked() {
        let (command_tx, _command_rx) = mpsc::unbounded_channel();
        let (notify_tx, mut notify_rx) = mpsc::channel(1);
        let blocked: Blocked = Arc::default();
        let mut transport = UdpTransport {
            commands: command_tx,
            notify: notify_tx,
            blocked: blocked.clone(),
        };
        let peer = PeerId::new("B");
        assert!(transport.send_chunk(&peer, b"one"));
        assert!(lock(&blocked).is_empty());
        assert!(!transport.send_chunk(&peer, b"two"));
        assert!(lock(&blocked).contains(&peer));

        assert_eq!(notify_rx.try_recv().unwrap(), (peer.clone(), b"one".to_vec()));
        assert!(transport.send_chunk(&peer, b"two"));
    }

    #[test]
    fn dead_radio_reports_unavailable() {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notify_tx, _notify_rx) = mpsc::channel(1);
        drop(command_rx);
        let mut transport = UdpTransport {
            commands: command_tx,
            notify: notify_tx,
            blocked: Arc::default(),
        };
        assert_eq!(
            transport.start_scanning(None),
            Err(TransportError::Unavailable(RadioState::PoweredOff))
        );
    }

    #[tokio::test]
    async fn disconnect_before_accept_fails_the_connect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = RadioConfig {
            discovery_port: 0,
            advert_interval: Duration::from_secs(3600),
            notify_queue: 1,
            characteristic: nearby_core::protocol::TRANSFER_CHARACTERISTIC_UUID,
        };
        let multicast = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let unicast = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let (_transport, mut radio) = split(PeerId::new("B"), &config, multicast, unicast, tx);
        let a = PeerId::new("A");
        radio
            .pending
            .insert(a.clone(), Instant::now() + CONNECT_TIMEOUT);

        let frame = AirFrame::Disconnect { from: a.clone() }.encode().unwrap();
        let from = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9);
        radio.on_unicast(&frame, from).await;
        assert!(radio.pending.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::ConnectFailed { peer, .. }) if peer == a
        ));

        // Nothing left to drop: a repeat is silent.
        radio.on_unicast(&frame, from).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn two_radios_exchange_profiles() {
        use nearby_core::{DiscoveryEngine, EngineConfig, LocalProfile, Mode};

        // Loopback sockets only: the sighting is driven by hand, no multicast route needed.
        async fn device(
            id: &str,
            name: &str,
        ) -> (
            DiscoveryEngine<UdpTransport, LocalProfile>,
            Radio,
            mpsc::UnboundedReceiver<TransportEvent>,
        ) {
            let (tx, rx) = mpsc::unbounded_channel();
            let config = RadioConfig {
                discovery_port: 0,
                advert_interval: Duration::from_secs(3600),
                notify_queue: 2,
                characteristic: nearby_core::protocol::TRANSFER_CHARACTERISTIC_UUID,
            };
            let multicast = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let unicast = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let (transport, radio) = split(PeerId::new(id), &config, multicast, unicast, tx);
            let engine = DiscoveryEngine::new(
                EngineConfig::default(),
                PeerId::new(id),
                transport,
                LocalProfile::new(PeerId::new(id), name),
            );
            (engine, radio, rx)
        }

        let (mut a, radio_a, mut rx_a) = device("A", "Alice").await;
        let (mut b, mut radio_b, mut rx_b) = device("B", "Bob").await;
        let a_port = radio_a.unicast.local_addr().unwrap().port();
        radio_b.addrs.insert(
            PeerId::new("A"),
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), a_port),
        );
        tokio::spawn(radio_a.run());
        tokio::spawn(radio_b.run());

        a.set_mode(Mode::BROADCASTING);
        b.set_mode(Mode::RECEIVING);
        b.handle(
            TransportEvent::PeerSighted {
                peer: PeerId::new("A"),
                rssi: -40,
            },
            Instant::now(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while b.roster().is_empty() {
            tokio::select! {
                Some(ev) = rx_a.recv() => a.handle(ev, Instant::now()),
                Some(ev) = rx_b.recv() => b.handle(ev, Instant::now()),
                _ = tokio::time::sleep_until(deadline) => panic!("no profile exchanged"),
            }
        }
        assert_eq!(b.roster()[0].display_name, "Alice");
    }
}

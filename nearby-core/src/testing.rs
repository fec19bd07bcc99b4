//! Recording transport double for engine tests.

use uuid::Uuid;

use crate::identity::PeerId;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartAdvertising(Uuid),
    StopAdvertising,
    StartScanning(Option<Uuid>),
    StopScanning,
    Connect(PeerId),
    Disconnect(PeerId),
    DiscoverServices(PeerId),
    DiscoverCharacteristics(PeerId),
    Subscribe(PeerId),
    SendChunk(PeerId, Vec<u8>),
    SendRefused(PeerId, Vec<u8>),
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub calls: Vec<Call>,
    /// 1-based `send_chunk` attempts to refuse.
    pub refuse_sends: Vec<usize>,
    pub fail_start: bool,
    pub fail_connect: bool,
    send_attempts: usize,
}

impl RecordingTransport {
    pub fn take(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn sent_to(&self, peer: &PeerId) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::SendChunk(p, bytes) if p == peer => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn start_advertising(&mut self, service: Uuid) -> Result<(), TransportError> {
        if self.fail_start {
            return Err(TransportError::Other("advertising unsupported".into()));
        }
        self.calls.push(Call::StartAdvertising(service));
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.calls.push(Call::StopAdvertising);
    }

    fn start_scanning(&mut self, service: Option<Uuid>) -> Result<(), TransportError> {
        if self.fail_start {
            return Err(TransportError::Other("scanning unsupported".into()));
        }
        self.calls.push(Call::StartScanning(service));
        Ok(())
    }

    fn stop_scanning(&mut self) {
        self.calls.push(Call::StopScanning);
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        if self.fail_connect {
            return Err(TransportError::ConnectFailed("out of range".into()));
        }
        self.calls.push(Call::Connect(peer.clone()));
        Ok(())
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.calls.push(Call::Disconnect(peer.clone()));
    }

    fn discover_services(&mut self, peer: &PeerId, _service: Uuid) {
        self.calls.push(Call::DiscoverServices(peer.clone()));
    }

    fn discover_characteristics(&mut self, peer: &PeerId, _service: Uuid, _characteristic: Uuid) {
        self.calls.push(Call::DiscoverCharacteristics(peer.clone()));
    }

    fn subscribe(&mut self, peer: &PeerId, _characteristic: Uuid) {
        self.calls.push(Call::Subscribe(peer.clone()));
    }

    fn send_chunk(&mut self, peer: &PeerId, chunk: &[u8]) -> bool {
        self.send_attempts += 1;
        if self.refuse_sends.contains(&self.send_attempts) {
            self.calls.push(Call::SendRefused(peer.clone(), chunk.to_vec()));
            return false;
        }
        self.calls.push(Call::SendChunk(peer.clone(), chunk.to_vec()));
        true
    }
}

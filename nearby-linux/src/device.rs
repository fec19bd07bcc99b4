//! The device loop: single task that owns the engine and serializes every event into it.

use std::time::{Duration, Instant};

use nearby_core::{
    DiscoveryEngine, Mode, Profile, ProfileProvider, RosterObserver, Transport, TransportEvent,
};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Logs the roster on every change.
pub struct RosterLog;

impl RosterObserver for RosterLog {
    fn on_roster_changed(&mut self, roster: &[Profile]) {
        info!(peers = roster.len(), "nearby peers");
        for p in roster {
            info!(
                peer = %p.identifier,
                name = %p.display_name,
                rssi = p.signal_strength,
                avatar = p.avatar.bytes().map_or(0, |b| b.len()),
                "  peer"
            );
        }
    }
}

/// Apply `mode`, then feed transport events and periodic ticks until `shutdown` fires
/// or the radio goes away. Leaves the engine in `Mode::OFF`.
pub async fn run<T, P>(
    mut engine: DiscoveryEngine<T, P>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mode: Mode,
    sweep_interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) where
    T: Transport,
    P: ProfileProvider,
{
    engine.set_mode(mode);
    let mut sweep = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => engine.handle(event, Instant::now()),
                None => break,
            },
            _ = sweep.tick() => engine.tick(Instant::now()),
            _ = &mut shutdown => break,
        }
    }
    engine.set_mode(Mode::OFF);
    info!("device stopped");
}

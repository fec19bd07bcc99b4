// Nearby Linux: discovery daemon over an emulated LAN radio.

mod air;
mod config;
mod device;

use anyhow::Context;
use nearby_core::{DiscoveryEngine, LocalProfile, PeerId};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("nearby-linux {}", VERSION);
            return Ok(());
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nearby_core=debug")),
        )
        .try_init();

    let cfg = config::load();
    let local_id = PeerId::random();
    let profile = local_profile(&cfg, &local_id);
    tracing::info!(peer = %local_id, mode = %cfg.mode, "nearby-linux {} starting", VERSION);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let radio_cfg = air::RadioConfig {
            discovery_port: cfg.discovery_port,
            advert_interval: cfg.advertise_interval(),
            notify_queue: cfg.notify_queue,
            characteristic: cfg.engine.characteristic_uuid,
        };
        let (transport, radio) = air::bind(local_id.clone(), radio_cfg, event_tx)
            .await
            .with_context(|| format!("binding discovery port {}", cfg.discovery_port))?;
        let radio_task = tokio::spawn(radio.run());

        let mut engine = DiscoveryEngine::new(cfg.engine.clone(), local_id, transport, profile);
        engine.subscribe(device::RosterLog);
        let (stop_tx, stop_rx) = oneshot::channel();
        let device_task = tokio::spawn(device::run(
            engine,
            event_rx,
            cfg.mode,
            cfg.sweep_interval(),
            stop_rx,
        ));

        shutdown_signal().await?;
        tracing::info!("shutting down");
        let _ = stop_tx.send(());
        device_task.await?;
        // Engine dropped: the radio drains its last commands and exits.
        radio_task.await??;
        Ok::<(), anyhow::Error>(())
    })
}

fn local_profile(cfg: &config::Config, id: &PeerId) -> LocalProfile {
    let mut profile = LocalProfile {
        identifier: id.clone(),
        display_name: cfg.username.clone(),
        avatar: None,
    };
    if profile.display_name.is_none() {
        tracing::warn!("no username configured; peers will not receive a profile");
    }
    if let Some(path) = &cfg.avatar_path {
        match std::fs::read(path) {
            Ok(bytes) => profile.avatar = Some(bytes),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot read avatar"),
        }
    }
    profile
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

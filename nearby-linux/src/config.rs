//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use nearby_core::{EngineConfig, Mode};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_USERNAME, NEARBY_MODE, NEARBY_DISCOVERY_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name broadcast to peers. Broadcasting sends nothing until set.
    #[serde(default)]
    pub username: Option<String>,
    /// Avatar image file, sent as-is.
    #[serde(default)]
    pub avatar_path: Option<PathBuf>,
    /// Mode at startup (default duplex).
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Multicast advert port (default 45690).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Notify chunks the radio buffers before refusing sends (default 8).
    #[serde(default = "default_notify_queue")]
    pub notify_queue: usize,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_mode() -> Mode {
    Mode::DUPLEX
}
fn default_discovery_port() -> u16 {
    45690
}
fn default_advertise_interval_ms() -> u64 {
    1000
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_notify_queue() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            avatar_path: None,
            mode: default_mode(),
            discovery_port: default_discovery_port(),
            advertise_interval_ms: default_advertise_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            notify_queue: default_notify_queue(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(name) = var("NEARBY_USERNAME") {
        c.username = Some(name);
    }
    if let Some(s) = var("NEARBY_MODE") {
        match s.parse::<Mode>() {
            Ok(m) => c.mode = m,
            Err(e) => tracing::warn!(error = %e, "ignoring NEARBY_MODE"),
        }
    }
    if let Some(s) = var("NEARBY_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => {
                        tracing::debug!(path = %p.display(), "config loaded");
                        return Some(c);
                    }
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "bad config, using defaults"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

//! Engine tunables. Deserializable so hosts can embed them in their own config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::Framing;
use crate::profile::ProfileEncoding;
use crate::protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_INVALIDATION_WINDOW, MAX_PAYLOAD_LEN, TRANSFER_CHARACTERISTIC_UUID,
    TRANSFER_SERVICE_UUID,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: Uuid,
    /// Logical chunk size supplied by the transport (default 20).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default)]
    pub profile_encoding: ProfileEncoding,
    /// Roster entries unseen for longer than this are swept (default 10).
    #[serde(default = "default_invalidation_window_secs")]
    pub invalidation_window_secs: u64,
    /// Fail receiver links that have not completed within this many seconds. Unset: no timeout.
    #[serde(default)]
    pub link_timeout_secs: Option<u64>,
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
}

fn default_service_uuid() -> Uuid {
    TRANSFER_SERVICE_UUID
}
fn default_characteristic_uuid() -> Uuid {
    TRANSFER_CHARACTERISTIC_UUID
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_invalidation_window_secs() -> u64 {
    DEFAULT_INVALIDATION_WINDOW.as_secs()
}
fn default_max_payload_len() -> usize {
    MAX_PAYLOAD_LEN
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            chunk_size: default_chunk_size(),
            framing: Framing::default(),
            profile_encoding: ProfileEncoding::default(),
            invalidation_window_secs: default_invalidation_window_secs(),
            link_timeout_secs: None,
            max_payload_len: default_max_payload_len(),
        }
    }
}

impl EngineConfig {
    pub fn invalidation_window(&self) -> Duration {
        Duration::from_secs(self.invalidation_window_secs)
    }

    pub fn link_timeout(&self) -> Option<Duration> {
        self.link_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.invalidation_window(), Duration::from_secs(10));
        assert_eq!(cfg.link_timeout(), None);
        assert_eq!(cfg.framing, Framing::EomMarker);
    }

    #[test]
    fn overrides_parse() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"chunk_size":182,"framing":"zero-length","profile_encoding":"bincode","link_timeout_secs":15}"#,
        )
        .unwrap();
        assert_eq!(cfg.chunk_size, 182);
        assert_eq!(cfg.framing, Framing::ZeroLength);
        assert_eq!(cfg.profile_encoding, ProfileEncoding::Bincode);
        assert_eq!(cfg.link_timeout(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(serde_json::from_str::<EngineConfig>(r#"{"chunk":1}"#).is_err());
    }
}

//! Peer identity and the local profile the engine broadcasts.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a remote device as reported by the transport.
/// Stable per physical peer for the session; not guaranteed across restarts.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Fresh random identifier (UUID v4, hyphenated upper-case like platform peripheral IDs).
    pub fn random() -> Self {
        Self::from(Uuid::new_v4())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Uuid> for PeerId {
    fn from(id: Uuid) -> Self {
        PeerId(id.hyphenated().to_string().to_ascii_uppercase())
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What this device advertises about itself. Owned by the settings store, read-only here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProfile {
    pub identifier: PeerId,
    /// Absent until the user has picked a username.
    pub display_name: Option<String>,
    pub avatar: Option<Vec<u8>>,
}

impl LocalProfile {
    pub fn new(identifier: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            identifier,
            display_name: Some(display_name.into()),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: Vec<u8>) -> Self {
        self.avatar = Some(avatar);
        self
    }
}

/// Read-only source of the local profile (settings store).
pub trait ProfileProvider {
    /// Current profile, or `None` when the settings store has nothing to offer yet.
    fn current_local_profile(&self) -> Option<LocalProfile>;

    /// Profile to send to one specific subscriber. Providers that scope the advertised
    /// identifier per peer override this; the default sends the same profile to everyone.
    fn profile_for_peer(&self, _peer: &PeerId) -> Option<LocalProfile> {
        self.current_local_profile()
    }
}

impl ProfileProvider for LocalProfile {
    fn current_local_profile(&self) -> Option<LocalProfile> {
        Some(self.clone())
    }
}

impl<P: ProfileProvider + ?Sized> ProfileProvider for std::sync::Arc<P> {
    fn current_local_profile(&self) -> Option<LocalProfile> {
        (**self).current_local_profile()
    }

    fn profile_for_peer(&self, peer: &PeerId) -> Option<LocalProfile> {
        (**self).profile_for_peer(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_peer_ids_are_upper_hyphenated() {
        let id = PeerId::from(Uuid::from_u128(0xca9a9753_7c75_4591_9038_26c163098aca));
        assert_eq!(id.as_str(), "CA9A9753-7C75-4591-9038-26C163098ACA");
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let id = PeerId::new("A");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"A\"");
        let back: PeerId = serde_json::from_str("\"A\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn static_profile_provider_ignores_peer() {
        let local = LocalProfile::new(PeerId::new("A"), "Alice");
        let for_b = local.profile_for_peer(&PeerId::new("B")).unwrap();
        assert_eq!(for_b, local);
    }
}

//! Profile exchange: the application payload carried by the chunk codec.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::identity::{LocalProfile, PeerId, ProfileProvider};
use crate::protocol::PROTOCOL_VERSION;

/// Avatar image bytes, or the built-in placeholder when the peer sent none.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Avatar {
    #[default]
    Placeholder,
    Image(Vec<u8>),
}

impl Avatar {
    fn from_bytes(bytes: Option<Vec<u8>>) -> Self {
        match bytes {
            Some(b) if !b.is_empty() => Avatar::Image(b),
            _ => Avatar::Placeholder,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Avatar::Placeholder => None,
            Avatar::Image(b) => Some(b),
        }
    }
}

/// A resolved nearby peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub identifier: PeerId,
    pub display_name: String,
    pub avatar: Avatar,
    /// Signal strength observed when the peer was sighted (dBm).
    pub signal_strength: i16,
    pub last_seen: Instant,
}

impl Profile {
    /// Compares everything but identity and freshness.
    pub fn same_content(&self, other: &Profile) -> bool {
        self.display_name == other.display_name
            && self.avatar == other.avatar
            && self.signal_strength == other.signal_strength
    }
}

/// Payload format. Both ends of a deployment must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileEncoding {
    /// JSON object `{identifier, username, image}` with a base64 image.
    #[default]
    Json,
    /// Versioned bincode record.
    Bincode,
}

#[derive(Serialize, Deserialize)]
struct JsonRecord {
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BinaryRecord {
    version: u8,
    identifier: String,
    display_name: String,
    avatar: Option<Vec<u8>>,
}

/// Encodes the local profile for subscribers and decodes received payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileAdapter {
    encoding: ProfileEncoding,
}

impl ProfileAdapter {
    pub fn new(encoding: ProfileEncoding) -> Self {
        Self { encoding }
    }

    /// Ask the provider for the profile scoped to `peer` and encode it.
    pub fn encode_for_peer<P: ProfileProvider + ?Sized>(
        &self,
        provider: &P,
        peer: &PeerId,
    ) -> Result<Vec<u8>, ProfileError> {
        let local = provider
            .profile_for_peer(peer)
            .ok_or(ProfileError::Unavailable)?;
        self.encode(&local)
    }

    pub fn encode(&self, local: &LocalProfile) -> Result<Vec<u8>, ProfileError> {
        if local.identifier.is_empty() {
            return Err(ProfileError::MissingField("identifier"));
        }
        let name = match local.display_name.as_deref() {
            Some(n) if !n.is_empty() => n,
            _ => return Err(ProfileError::MissingField("username")),
        };
        match self.encoding {
            ProfileEncoding::Json => {
                let record = JsonRecord {
                    identifier: Some(local.identifier.to_string()),
                    username: Some(name.to_owned()),
                    image: local.avatar.as_deref().map(|b| BASE64.encode(b)),
                };
                Ok(serde_json::to_vec(&record)?)
            }
            ProfileEncoding::Bincode => {
                let record = BinaryRecord {
                    version: PROTOCOL_VERSION,
                    identifier: local.identifier.to_string(),
                    display_name: name.to_owned(),
                    avatar: local.avatar.clone(),
                };
                Ok(bincode::serialize(&record)?)
            }
        }
    }

    /// Decode a reassembled payload. `signal_strength` is what the receiver observed at
    /// sighting; the sender's own value, if any, is ignored.
    pub fn decode(
        &self,
        bytes: &[u8],
        signal_strength: i16,
        now: Instant,
    ) -> Result<Profile, ProfileError> {
        let (identifier, display_name, avatar) = match self.encoding {
            ProfileEncoding::Json => {
                let record: JsonRecord = serde_json::from_slice(bytes)?;
                let avatar = match record.image {
                    Some(s) => Some(BASE64.decode(s.as_bytes())?),
                    None => None,
                };
                (record.identifier, record.username, avatar)
            }
            ProfileEncoding::Bincode => {
                let record: BinaryRecord = bincode::deserialize(bytes)?;
                if record.version != PROTOCOL_VERSION {
                    return Err(ProfileError::Version(record.version));
                }
                (
                    Some(record.identifier),
                    Some(record.display_name),
                    record.avatar,
                )
            }
        };
        let identifier = identifier
            .filter(|s| !s.is_empty())
            .ok_or(ProfileError::MissingField("identifier"))?;
        let display_name = display_name
            .filter(|s| !s.is_empty())
            .ok_or(ProfileError::MissingField("username"))?;
        Ok(Profile {
            identifier: PeerId::new(identifier),
            display_name,
            avatar: Avatar::from_bytes(avatar),
            signal_strength,
            last_seen: now,
        })
    }
}

/// Error encoding or decoding a profile payload.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("no local profile available")]
    Unavailable,
    #[error("profile is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("avatar is not valid base64: {0}")]
    InvalidAvatar(#[from] base64::DecodeError),
    #[error("unsupported profile version {0}")]
    Version(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> LocalProfile {
        LocalProfile::new(PeerId::new("A"), "Alice")
    }

    #[test]
    fn json_roundtrip_keeps_fields() {
        let adapter = ProfileAdapter::new(ProfileEncoding::Json);
        let local = alice().with_avatar(vec![0xff, 0xd8, 0xff]);
        let bytes = adapter.encode(&local).unwrap();
        let now = Instant::now();
        let p = adapter.decode(&bytes, -61, now).unwrap();
        assert_eq!(p.identifier, PeerId::new("A"));
        assert_eq!(p.display_name, "Alice");
        assert_eq!(p.avatar, Avatar::Image(vec![0xff, 0xd8, 0xff]));
        assert_eq!(p.signal_strength, -61);
        assert_eq!(p.last_seen, now);
    }

    #[test]
    fn decodes_legacy_json_with_rssi_placeholder() {
        let adapter = ProfileAdapter::default();
        let bytes = br#"{"identifier":"B","username":"Bob","rssi":""}"#;
        let p = adapter.decode(bytes, -40, Instant::now()).unwrap();
        assert_eq!(p.display_name, "Bob");
        assert_eq!(p.avatar, Avatar::Placeholder);
        assert_eq!(p.signal_strength, -40);
    }

    #[test]
    fn missing_required_fields_rejected() {
        let adapter = ProfileAdapter::default();
        let no_name = br#"{"identifier":"B"}"#;
        assert!(matches!(
            adapter.decode(no_name, 0, Instant::now()),
            Err(ProfileError::MissingField("username"))
        ));
        let empty_id = br#"{"identifier":"","username":"Bob"}"#;
        assert!(matches!(
            adapter.decode(empty_id, 0, Instant::now()),
            Err(ProfileError::MissingField("identifier"))
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let adapter = ProfileAdapter::default();
        assert!(matches!(
            adapter.decode(b"\x00\x01not json", 0, Instant::now()),
            Err(ProfileError::Json(_))
        ));
        let bad_image = br#"{"identifier":"B","username":"Bob","image":"***"}"#;
        assert!(matches!(
            adapter.decode(bad_image, 0, Instant::now()),
            Err(ProfileError::InvalidAvatar(_))
        ));
    }

    #[test]
    fn bincode_roundtrip_and_version_check() {
        let adapter = ProfileAdapter::new(ProfileEncoding::Bincode);
        let bytes = adapter.encode(&alice()).unwrap();
        let p = adapter.decode(&bytes, -70, Instant::now()).unwrap();
        assert_eq!(p.display_name, "Alice");

        let future = bincode::serialize(&BinaryRecord {
            version: PROTOCOL_VERSION + 1,
            identifier: "A".into(),
            display_name: "Alice".into(),
            avatar: None,
        })
        .unwrap();
        assert!(matches!(
            adapter.decode(&future, 0, Instant::now()),
            Err(ProfileError::Version(_))
        ));
    }

    #[test]
    fn encode_requires_username() {
        let adapter = ProfileAdapter::default();
        let mut local = alice();
        local.display_name = None;
        assert!(matches!(
            adapter.encode(&local),
            Err(ProfileError::MissingField("username"))
        ));
    }

    struct PerPeer;

    impl ProfileProvider for PerPeer {
        fn current_local_profile(&self) -> Option<LocalProfile> {
            None
        }

        fn profile_for_peer(&self, peer: &PeerId) -> Option<LocalProfile> {
            Some(LocalProfile::new(
                PeerId::new(format!("me-for-{peer}")),
                "Scoped",
            ))
        }
    }

    #[test]
    fn encode_for_peer_uses_scoped_identifier() {
        let adapter = ProfileAdapter::default();
        let bytes = adapter.encode_for_peer(&PerPeer, &PeerId::new("B")).unwrap();
        let p = adapter.decode(&bytes, 0, Instant::now()).unwrap();
        assert_eq!(p.identifier.as_str(), "me-for-B");
    }

    #[test]
    fn encode_for_peer_without_profile_is_unavailable() {
        struct Empty;
        impl ProfileProvider for Empty {
            fn current_local_profile(&self) -> Option<LocalProfile> {
                None
            }
        }
        assert!(matches!(
            ProfileAdapter::default().encode_for_peer(&Empty, &PeerId::new("B")),
            Err(ProfileError::Unavailable)
        ));
    }

    #[test]
    fn same_content_ignores_last_seen() {
        let adapter = ProfileAdapter::default();
        let bytes = adapter.encode(&alice()).unwrap();
        let t0 = Instant::now();
        let a = adapter.decode(&bytes, -50, t0).unwrap();
        let b = adapter
            .decode(&bytes, -50, t0 + std::time::Duration::from_secs(3))
            .unwrap();
        assert!(a.same_content(&b));
        let c = adapter.decode(&bytes, -51, t0).unwrap();
        assert!(!a.same_content(&c));
    }
}

//! Nearby wire protocol: identifiers, chunking defaults and version.

use std::time::Duration;

use uuid::Uuid;

/// Current protocol version. Carried in binary profile records.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service advertised by broadcasters and filtered on by scanners.
pub const TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0xca9a9753_7c75_4591_9038_26c163098aca);

/// Notify characteristic carrying the chunked profile.
pub const TRANSFER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x655d83c1_f49b_45a9_b321_047814bc6729);

/// Default logical chunk size in bytes (notify MTU of the medium).
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// End-of-message marker for sentinel-as-data framing.
pub const EOM_MARKER: &[u8] = b"EOM";

/// Roster entries older than this are dropped by the sweep.
pub const DEFAULT_INVALIDATION_WINDOW: Duration = Duration::from_secs(10);

/// Upper bound on a reassembled payload. Avatars are tiny JPEGs; anything past this is garbage.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024;

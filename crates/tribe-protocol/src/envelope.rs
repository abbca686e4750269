//! The fixed header that precedes every tribe notification.

use serde::{Deserialize, Serialize};

/// Envelope size in bytes.
pub const ENVELOPE_LEN: usize = 12;

/// Protocol version written by [`crate::codec::encode`] when none is given.
pub const DEFAULT_PROTOCOL_VERSION: i32 = 1;

/// The 12-byte envelope: protocol version, source server, variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    /// Version of the game server that produced the record.
    pub protocol_version: i32,
    /// Packed id of the game server that produced the record.
    pub source_id: u32,
    /// Tag selecting the body layout.
    pub discriminant: i32,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub const fn new(protocol_version: i32, source_id: u32, discriminant: i32) -> Self {
        Self {
            protocol_version,
            source_id,
            discriminant,
        }
    }

    /// Grid coordinates of the source server.
    #[must_use]
    pub fn source_grid(&self) -> [u16; 2] {
        unpack_server_id(self.source_id)
    }
}

/// Split a packed server id into its grid coordinates.
///
/// Server ids pack two little-endian `u16` halves: the low half is the X
/// grid index, the high half is Y.
#[must_use]
pub fn unpack_server_id(packed: u32) -> [u16; 2] {
    let bytes = packed.to_le_bytes();
    [
        u16::from_le_bytes([bytes[0], bytes[1]]),
        u16::from_le_bytes([bytes[2], bytes[3]]),
    ]
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [x, y] = self.source_grid();
        write!(
            f,
            "v{} from {}:{} tag {}",
            self.protocol_version, x, y, self.discriminant
        )
    }
}

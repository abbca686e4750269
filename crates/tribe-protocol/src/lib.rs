//! # tribe-protocol
//!
//! Binary wire format for tribe notifications published by the game servers.
//!
//! Every payload starts with a 12-byte little-endian [`Envelope`]
//! (`protocol_version: i32`, `source_id: u32`, `discriminant: i32`) followed
//! by a variant body:
//!
//! - `1` - [`Chat`]
//! - `2` - [`EntityUpdate`]
//! - `3` - [`PresenceUpdate`]
//!
//! Unrecognized discriminants decode to [`DecodeError::UnknownVariant`].
//!
//! ## Example
//!
//! ```rust
//! use tribe_protocol::{codec, PresenceUpdate, Record};
//!
//! let record = Record::PresenceUpdate(PresenceUpdate {
//!     player_id: 42,
//!     last_online_at: 1_700_000_000,
//! });
//!
//! let encoded = codec::encode(&record, 1, 0);
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, record);
//! ```

pub mod codec;
pub mod envelope;
pub mod records;

pub use codec::{decode, decode_message, encode, DecodeError, WireWriter};
pub use envelope::{unpack_server_id, Envelope, ENVELOPE_LEN};
pub use records::{Chat, Discriminant, EntityUpdate, PresenceUpdate, Record};

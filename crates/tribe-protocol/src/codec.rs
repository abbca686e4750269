//! Decoder (and matching encoder) for tribe notification payloads.
//!
//! A payload is a 12-byte little-endian envelope followed by a body whose
//! layout is selected by the envelope discriminant. Bodies are built from
//! length-prefixed strings, fixed-width scalars and engine "property"
//! wrappers; the wrappers' metadata is parsed and discarded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::{Envelope, ENVELOPE_LEN};
use crate::records::{Chat, Discriminant, EntityUpdate, PresenceUpdate, Record};

/// Errors produced while decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A field could not be read; the whole record is discarded.
    #[error("Malformed {variant} record at byte {offset}")]
    MalformedRecord {
        /// Variant being decoded (`"Envelope"` while reading the header).
        variant: &'static str,
        /// Absolute offset of the field that failed.
        offset: usize,
    },

    /// The discriminant does not name a known layout.
    #[error("Unknown variant discriminant {discriminant}")]
    UnknownVariant {
        /// The unrecognized discriminant.
        discriminant: i32,
    },
}

type BodyDecoder = fn(&mut WireReader<'_>) -> Result<Record, DecodeError>;

/// Discriminant → body decoder. Anything not listed is `UnknownVariant`.
const VARIANTS: [(Discriminant, BodyDecoder); 3] = [
    (Discriminant::Chat, decode_chat),
    (Discriminant::EntityUpdate, decode_entity_update),
    (Discriminant::PresenceUpdate, decode_presence_update),
];

/// Decode a payload into a record.
///
/// # Errors
///
/// Returns `UnknownVariant` for unrecognized discriminants and
/// `MalformedRecord` if any field is truncated or invalid.
pub fn decode(data: &[u8]) -> Result<Record, DecodeError> {
    decode_message(data).map(|(_, record)| record)
}

/// Decode a payload, returning the envelope alongside the record.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_message(data: &[u8]) -> Result<(Envelope, Record), DecodeError> {
    let mut reader = WireReader::new(data, "Envelope");
    let envelope = reader.read_envelope()?;

    let (discriminant, body) = VARIANTS
        .iter()
        .find(|(d, _)| i32::from(*d) == envelope.discriminant)
        .copied()
        .ok_or(DecodeError::UnknownVariant {
            discriminant: envelope.discriminant,
        })?;

    reader.variant = discriminant.name();
    let record = body(&mut reader)?;
    Ok((envelope, record))
}

/// Read the envelope alone.
///
/// # Errors
///
/// Returns `MalformedRecord` if fewer than 12 bytes are available.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, DecodeError> {
    WireReader::new(data, "Envelope").read_envelope()
}

fn decode_chat(r: &mut WireReader<'_>) -> Result<Record, DecodeError> {
    Ok(Record::Chat(Chat {
        sender_name: r.read_string()?,
        sender_steam_name: r.read_string()?,
        sender_tribe_name: r.read_string()?,
        sender_id: r.read_u32()?,
        message: r.read_string()?,
        sender_team_index: r.read_i32()?,
        send_mode: r.read_string()?,
        user_id: r.read_string()?,
        use_admin_icon: r.read_bool()?,
        is_tribe_owner: r.read_bool()?,
        player_badge_group: r.read_i32()?,
    }))
}

fn decode_entity_update(r: &mut WireReader<'_>) -> Result<Record, DecodeError> {
    let is_new_entity = r.read_bool()?;
    let is_just_location_change = r.read_bool()?;

    let entity_id = r.read_u32_property()?;
    let parent_entity_id = r.read_u32_property()?;
    let entity_type = r.read_byte_property()?;
    let ship_type = r.read_byte_property()?;
    let entity_name = r.read_string_property()?;
    let server_id = r.read_u32_property()?;
    let (x, y) = r.read_vector2d_property()?;
    let _next_allowed_use_time = r.read_u32_property()?;
    let _in_land_claimed_flag_range = r.read_bool_property()?;
    let _reached_max_travel_count = r.read_bool_property()?;
    let is_dead = r.read_bool_property()?;

    Ok(Record::EntityUpdate(EntityUpdate {
        entity_id,
        parent_entity_id,
        entity_type,
        ship_type,
        entity_name,
        server_id,
        x,
        y,
        is_dead,
        is_new_entity,
        is_just_location_change,
    }))
}

fn decode_presence_update(r: &mut WireReader<'_>) -> Result<Record, DecodeError> {
    Ok(Record::PresenceUpdate(PresenceUpdate {
        player_id: r.read_u32()?,
        last_online_at: r.read_i32()?,
    }))
}

/// Cursor over a payload that reports failures as `MalformedRecord`.
struct WireReader<'a> {
    buf: &'a [u8],
    len: usize,
    variant: &'static str,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8], variant: &'static str) -> Self {
        Self {
            buf,
            len: buf.len(),
            variant,
        }
    }

    fn offset(&self) -> usize {
        self.len - self.buf.remaining()
    }

    fn malformed(&self, offset: usize) -> DecodeError {
        DecodeError::MalformedRecord {
            variant: self.variant,
            offset,
        }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(self.malformed(self.offset()));
        }
        Ok(())
    }

    fn read_envelope(&mut self) -> Result<Envelope, DecodeError> {
        self.need(ENVELOPE_LEN)?;
        Ok(Envelope::new(
            self.buf.get_i32_le(),
            self.buf.get_u32_le(),
            self.buf.get_i32_le(),
        ))
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    /// A float that must be neither NaN nor infinite.
    fn read_finite_f32(&mut self) -> Result<f32, DecodeError> {
        let start = self.offset();
        let value = self.read_f32()?;
        if !value.is_finite() {
            return Err(self.malformed(start));
        }
        Ok(value)
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8() != 0)
    }

    /// Length-prefixed string with trailing NUL padding removed.
    fn read_string(&mut self) -> Result<String, DecodeError> {
        let start = self.offset();
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| self.malformed(start))?;
        if len > self.buf.remaining() {
            return Err(self.malformed(start));
        }

        let buf = self.buf;
        let (text, rest) = buf.split_at(len);
        self.buf = rest;

        let end = text.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        Ok(String::from_utf8_lossy(&text[..end]).into_owned())
    }

    /// Property name and type name.
    fn skip_property_header(&mut self) -> Result<(), DecodeError> {
        self.read_string()?;
        self.read_string()?;
        Ok(())
    }

    fn read_string_property(&mut self) -> Result<String, DecodeError> {
        self.skip_property_header()?;
        self.read_u64()?;
        self.read_string()
    }

    fn read_u32_property(&mut self) -> Result<u32, DecodeError> {
        self.skip_property_header()?;
        self.read_string()?;
        self.read_u32()
    }

    fn read_vector2d_property(&mut self) -> Result<(f32, f32), DecodeError> {
        self.skip_property_header()?;
        self.read_u64()?;
        self.read_string()?;
        let x = self.read_finite_f32()?;
        let y = self.read_finite_f32()?;
        Ok((x, y))
    }

    /// Enum-valued property; the value is the enumerator name.
    fn read_byte_property(&mut self) -> Result<String, DecodeError> {
        self.skip_property_header()?;
        self.read_u64()?;
        self.read_string()?;
        self.read_string()
    }

    fn read_bool_property(&mut self) -> Result<bool, DecodeError> {
        self.skip_property_header()?;
        self.read_u64()?;
        self.read_bool()
    }
}

/// Builder for payloads in the wire layout.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Start a payload with the given envelope.
    #[must_use]
    pub fn new(envelope: &Envelope) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32_le(envelope.protocol_version);
        buf.put_u32_le(envelope.source_id);
        buf.put_i32_le(envelope.discriminant);
        Self { buf }
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32_le(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Length-prefixed string, NUL terminated the way the engine writes it.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_i32(wire_len(value.len() + 1));
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Length-prefixed raw bytes, written as given.
    pub fn put_raw_string(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_i32(wire_len(bytes.len()));
        self.buf.extend_from_slice(bytes);
        self
    }

    fn put_property_header(&mut self, name: &str, kind: &str) -> &mut Self {
        self.put_string(name).put_string(kind)
    }

    pub fn put_string_property(&mut self, name: &str, value: &str) -> &mut Self {
        self.put_property_header(name, "StrProperty")
            .put_u64(0)
            .put_string(value)
    }

    pub fn put_u32_property(&mut self, name: &str, value: u32) -> &mut Self {
        self.put_property_header(name, "UInt32Property")
            .put_string("")
            .put_u32(value)
    }

    pub fn put_vector2d_property(&mut self, name: &str, x: f32, y: f32) -> &mut Self {
        self.put_property_header(name, "StructProperty")
            .put_u64(0)
            .put_string("Vector2D")
            .put_f32(x)
            .put_f32(y)
    }

    pub fn put_byte_property(&mut self, name: &str, enum_name: &str, value: &str) -> &mut Self {
        self.put_property_header(name, "ByteProperty")
            .put_u64(0)
            .put_string(enum_name)
            .put_string(value)
    }

    pub fn put_bool_property(&mut self, name: &str, value: bool) -> &mut Self {
        self.put_property_header(name, "BoolProperty")
            .put_u64(0)
            .put_bool(value)
    }

    /// Finish the payload.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

fn wire_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

/// Encode a record with a fresh envelope.
#[must_use]
pub fn encode(record: &Record, protocol_version: i32, source_id: u32) -> Bytes {
    let envelope = Envelope::new(
        protocol_version,
        source_id,
        record.discriminant().into(),
    );
    let mut w = WireWriter::new(&envelope);

    match record {
        Record::Chat(chat) => {
            w.put_string(&chat.sender_name)
                .put_string(&chat.sender_steam_name)
                .put_string(&chat.sender_tribe_name)
                .put_u32(chat.sender_id)
                .put_string(&chat.message)
                .put_i32(chat.sender_team_index)
                .put_string(&chat.send_mode)
                .put_string(&chat.user_id)
                .put_bool(chat.use_admin_icon)
                .put_bool(chat.is_tribe_owner)
                .put_i32(chat.player_badge_group);
        }
        Record::EntityUpdate(entity) => {
            w.put_bool(entity.is_new_entity)
                .put_bool(entity.is_just_location_change)
                .put_u32_property("EntityID", entity.entity_id)
                .put_u32_property("ParentEntityID", entity.parent_entity_id)
                .put_byte_property("EntityType", "ETribeEntityType", &entity.entity_type)
                .put_byte_property("ShipType", "EShipType", &entity.ship_type)
                .put_string_property("EntityName", &entity.entity_name)
                .put_u32_property("ServerID", entity.server_id)
                .put_vector2d_property(
                    "ServerRelativeLocationInCurrentServerMap",
                    entity.x,
                    entity.y,
                )
                .put_u32_property("NextAllowedUseTime", 0)
                .put_bool_property("bInLandClaimedFlagRange", false)
                .put_bool_property("bReachedMaxTravelCount", false)
                .put_bool_property("bIsDead", entity.is_dead);
        }
        Record::PresenceUpdate(presence) => {
            w.put_u32(presence.player_id).put_i32(presence.last_online_at);
        }
    }

    w.finish()
}

//! Minimal RESP2 codec for the Redis pub/sub connection.
//!
//! Only what a subscriber needs: encoding commands as arrays of bulk strings
//! and incrementally decoding replies and pushes from a read buffer.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Maximum bulk string size accepted from the server (512 MiB, Redis' own limit).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth.
const MAX_DEPTH: usize = 8;

/// RESP decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RespError {
    #[error("Unknown RESP type byte: 0x{0:02x}")]
    UnknownType(u8),

    #[error("Invalid RESP length: {0}")]
    InvalidLength(String),

    #[error("Bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    #[error("Bulk string not terminated by CRLF")]
    MissingTerminator,

    #[error("RESP nesting too deep")]
    TooDeep,
}

/// A decoded RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string.
    Bulk(Option<Bytes>),
    /// `None` is the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Bulk or simple string contents.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(s) => Some(s.as_bytes()),
            RespValue::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }
}

/// Encode a command as an array of bulk strings.
#[must_use]
pub fn encode_command(args: &[&[u8]]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Decode one value from a streaming buffer.
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete value; the
/// buffer is only consumed once a value is complete.
///
/// # Errors
///
/// Returns an error if the buffer holds data that is not valid RESP2.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
    match parse(&buf[..], 0, 0)? {
        Some((value, consumed)) => {
            let _ = buf.split_to(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Parse the value starting at `pos`. Returns the value and the position
/// just past it.
fn parse(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    if depth > MAX_DEPTH {
        return Err(RespError::TooDeep);
    }
    let Some(&kind) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match kind {
        b'+' => Ok(Some((RespValue::Simple(text(line)), next))),
        b'-' => Ok(Some((RespValue::Error(text(line)), next))),
        b':' => Ok(Some((RespValue::Integer(integer(line)?), next))),
        b'$' => {
            let len = integer(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let len = usize::try_from(len).map_err(|_| RespError::InvalidLength(text(line)))?;
            if len > MAX_BULK_SIZE {
                return Err(RespError::BulkTooLarge(len));
            }
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(RespError::MissingTerminator);
            }
            let data = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((RespValue::Bulk(Some(data)), end + 2)))
        }
        b'*' => {
            let count = integer(line)?;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let count =
                usize::try_from(count).map_err(|_| RespError::InvalidLength(text(line)))?;
            let mut items = Vec::with_capacity(count.min(64));
            let mut cursor = next;
            for _ in 0..count {
                match parse(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(RespError::UnknownType(other)),
    }
}

/// Find the CRLF-terminated line starting at `pos`.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], pos + end + 2))
}

fn text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn integer(line: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RespError::InvalidLength(text(line)))
}

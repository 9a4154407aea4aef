//! Wire codec for exchange messages: `kind(u8) | path_length(varint) |
//! path_bytes | session_bytes` (spec §4.6, §6).
//!
//! No teacher analogue encodes a custom binary protocol; the varint and
//! `BytesMut`/`Buf` usage follows the same `bytes` crate this codebase
//! already depends on for buffer handling elsewhere.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::model::path::Path;
use crate::model::session::SessionId;

const KIND_READ_LOCK_RELEASED: u8 = 1;
const KIND_WRITE_LOCK_RELEASED: u8 = 2;
const KIND_INVALIDATE_CACHE_ENTRY: u8 = 3;

/// Errors decoding a wire-format exchange message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short to contain a message header")]
    Truncated,
    #[error("unknown message kind byte: {0}")]
    UnknownKind(u8),
    #[error("invalid path encoding: {0}")]
    InvalidPath(String),
    #[error("invalid session id encoding: {0}")]
    InvalidSessionId(String),
}

/// A message exchanged between nodes to coordinate lock state (spec §4.6).
///
/// All three are idempotent and safe to re-deliver; delivery is
/// at-least-once with no ordering guarantee across distinct paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeMessage {
    /// Broadcasts that a read-lock on `path` held by `released_by` was
    /// released; wakes waiters keyed `(path, released_by)`.
    ReadLockReleased { path: Path, released_by: SessionId },
    /// Broadcasts that the write-lock on `path` held by `released_by` was
    /// released; wakes waiters keyed `(path, released_by)`.
    WriteLockReleased { path: Path, released_by: SessionId },
    /// Directed at `session`: release its read-lock on `path` and drop the
    /// cached copy.
    InvalidateCacheEntry { path: Path, session: SessionId },
}

impl ExchangeMessage {
    /// Encode this message per the wire contract.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let (kind, path, session) = match self {
            ExchangeMessage::ReadLockReleased { path, released_by } => {
                (KIND_READ_LOCK_RELEASED, path, *released_by)
            }
            ExchangeMessage::WriteLockReleased { path, released_by } => {
                (KIND_WRITE_LOCK_RELEASED, path, *released_by)
            }
            ExchangeMessage::InvalidateCacheEntry { path, session } => {
                (KIND_INVALIDATE_CACHE_ENTRY, path, *session)
            }
        };

        let path_bytes = path.format().into_bytes();
        let session_bytes = session.as_key().into_bytes();
        let mut buf = BytesMut::with_capacity(1 + 10 + path_bytes.len() + session_bytes.len());
        buf.put_u8(kind);
        write_varint(&mut buf, path_bytes.len() as u64);
        buf.put_slice(&path_bytes);
        write_varint(&mut buf, session_bytes.len() as u64);
        buf.put_slice(&session_bytes);
        buf.freeze()
    }

    /// Decode a message previously produced by [`ExchangeMessage::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if `bytes` is truncated, carries an unknown
    /// kind byte, or an embedded path/session-id fails to parse.
    pub fn decode(mut bytes: Bytes) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Truncated);
        }
        let kind = bytes.get_u8();

        let path_len = read_varint(&mut bytes)?;
        if (bytes.remaining() as u64) < path_len {
            return Err(DecodeError::Truncated);
        }
        let path_bytes = bytes.copy_to_bytes(path_len as usize);
        let path = Path::parse(
            std::str::from_utf8(&path_bytes).map_err(|e| DecodeError::InvalidPath(e.to_string()))?,
        )
        .map_err(|e| DecodeError::InvalidPath(e.to_string()))?;

        let session_len = read_varint(&mut bytes)?;
        if (bytes.remaining() as u64) < session_len {
            return Err(DecodeError::Truncated);
        }
        let session_bytes = bytes.copy_to_bytes(session_len as usize);
        let session: SessionId = std::str::from_utf8(&session_bytes)
            .map_err(|e| DecodeError::InvalidSessionId(e.to_string()))?
            .parse()
            .map_err(|e: uuid::Error| DecodeError::InvalidSessionId(e.to_string()))?;

        match kind {
            KIND_READ_LOCK_RELEASED => Ok(ExchangeMessage::ReadLockReleased {
                path,
                released_by: session,
            }),
            KIND_WRITE_LOCK_RELEASED => Ok(ExchangeMessage::WriteLockReleased {
                path,
                released_by: session,
            }),
            KIND_INVALIDATE_CACHE_ENTRY => Ok(ExchangeMessage::InvalidateCacheEntry { path, session }),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

fn write_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn read_varint(buf: &mut Bytes) -> Result<u64, DecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if buf.is_empty() {
            return Err(DecodeError::Truncated);
        }
        let byte = buf.get_u8();
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_each_kind() {
        let path = Path::parse("/a/b").unwrap();
        let session = SessionId::new();

        let messages = vec![
            ExchangeMessage::ReadLockReleased {
                path: path.clone(),
                released_by: session,
            },
            ExchangeMessage::WriteLockReleased {
                path: path.clone(),
                released_by: session,
            },
            ExchangeMessage::InvalidateCacheEntry { path, session },
        ];

        for message in messages {
            let encoded = message.encode();
            let decoded = ExchangeMessage::decode(encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert_eq!(ExchangeMessage::decode(Bytes::new()), Err(DecodeError::Truncated));
    }

    #[test]
    fn rejects_unknown_kind() {
        let path = Path::root();
        let mut message = ExchangeMessage::ReadLockReleased {
            path,
            released_by: SessionId::new(),
        }
        .encode()
        .to_vec();
        message[0] = 99;
        assert_eq!(
            ExchangeMessage::decode(Bytes::from(message)),
            Err(DecodeError::UnknownKind(99))
        );
    }
}

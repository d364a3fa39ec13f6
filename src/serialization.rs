//! Postcard-based record encoding with a versioned envelope.
//!
//! Every record written to the backend (cache entries, version lists, tag
//! lists, lock records) goes through [`encode`]/[`decode`]. The envelope
//! carries a magic header and a schema version so foreign or stale bytes
//! under a key are rejected instead of misread.
//!
//! Encoding is deterministic: encoding the same value twice yields the same
//! bytes. The lock engine relies on this when it confirms ownership by
//! comparing a re-read record against the record it just wrote.
//!
//! # Format
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (4 bytes)│POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "TCHE"              u32 (LE)          postcard::to_allocvec(T)
//! ```

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic header identifying records written by this crate.
pub const RECORD_MAGIC: [u8; 4] = *b"TCHE";

/// Current record schema version.
///
/// Increment on any breaking change to the stored record types; old records
/// are then treated as absent and rebuilt rather than silently migrated.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Encode a record with the magic/version envelope.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(value).map_err(|e| Error::SerializationError(e.to_string()))?;

    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&RECORD_MAGIC);
    bytes.extend_from_slice(&RECORD_SCHEMA_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a record, validating the envelope first.
///
/// # Errors
///
/// - `Error::DeserializationError`: short buffer, bad magic, version
///   mismatch, or corrupted payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < 8 {
        return Err(Error::DeserializationError(format!(
            "record too short: {} bytes",
            bytes.len()
        )));
    }

    if bytes[0..4] != RECORD_MAGIC {
        return Err(Error::DeserializationError(
            "bad record magic".to_string(),
        ));
    }

    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != RECORD_SCHEMA_VERSION {
        return Err(Error::DeserializationError(format!(
            "record schema version mismatch: expected {}, found {}",
            RECORD_SCHEMA_VERSION, version
        )));
    }

    postcard::from_bytes(&bytes[8..]).map_err(|e| Error::DeserializationError(e.to_string()))
}

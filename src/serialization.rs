//! Versioned envelope around postcard-encoded cache values.
//!
//! # Format
//!
//! ```text
//! [MAGIC: 4 bytes] [VERSION: 4 bytes LE] [POSTCARD PAYLOAD]
//! ```
//!
//! Bump [`CACHE_SCHEMA_VERSION`] whenever a stored type changes shape; entries
//! written under another version are then treated as misses by regions.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic header identifying entries written by this crate.
pub const CACHE_MAGIC: [u8; 4] = *b"ORMC";

/// Current schema version of stored keys and entries.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Serialize `value` into an envelope.
///
/// # Errors
/// `Error::SerializationError` when postcard cannot encode the value.
pub fn serialize_for_cache<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(value).map_err(|e| Error::SerializationError(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&CACHE_MAGIC);
    bytes.extend_from_slice(&CACHE_SCHEMA_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Validate the envelope and decode its payload.
///
/// # Errors
///
/// - `Error::InvalidCacheEntry`: truncated bytes or bad magic
/// - `Error::VersionMismatch`: written under another schema version
/// - `Error::DeserializationError`: corrupted payload
pub fn deserialize_from_cache<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidCacheEntry(format!(
            "entry too short: {} bytes",
            bytes.len()
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[..4] != CACHE_MAGIC {
        return Err(Error::InvalidCacheEntry("bad magic header".to_string()));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&header[4..]);
    let found = u32::from_le_bytes(version);
    if found != CACHE_SCHEMA_VERSION {
        return Err(Error::VersionMismatch {
            expected: CACHE_SCHEMA_VERSION,
            found,
        });
    }

    postcard::from_bytes(payload).map_err(|e| Error::DeserializationError(e.to_string()))
}

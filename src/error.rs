//! Error types for cache operations.
//!
//! A cache miss is never an error: lookups return `Ok(None)`. Lock token
//! mismatches are absorbed by the lock region and reported through
//! [`crate::observability::CacheMetrics`] instead of being propagated.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by regions, strategies, hydrators and persisters.
#[derive(Debug, Error)]
pub enum Error {
    /// A read-only region received a differing entry for an existing key.
    ///
    /// The region is left untouched. This indicates a mapping or usage bug:
    /// read-only entities must never change.
    #[error("Cache entry {key} in read-only region {region} was changed")]
    InvalidatedEntry { region: String, key: String },

    /// Key construction received missing or incompatible identifier data.
    #[error("Malformed cache key: {0}")]
    MalformedKey(String),

    /// Attempt to update an entity or collection cached as read-only.
    #[error("Cannot update read-only cached {0}")]
    ReadOnlyEntity(String),

    /// Caching was requested for a class that carries no cache mapping.
    #[error("Entity {0} is not configured for second-level caching")]
    NonCacheableEntity(String),

    /// Entry could not be encoded for storage.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stored payload could not be decoded.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Stored bytes do not carry a valid envelope.
    #[error("Invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    /// Envelope was written with another schema version.
    #[error("Cache schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Backing store failure.
    #[error("Cache backend error: {0}")]
    BackendError(String),

    /// Database collaborator failure.
    #[error("Repository error: {0}")]
    RepositoryError(String),

    /// Invalid configuration or metadata.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ConfigError(e.to_string())
    }
}

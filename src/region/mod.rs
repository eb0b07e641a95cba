//! Regions: named partitions of the backing store.
//!
//! - [`DefaultRegion`] stores serialized entries under namespaced keys.
//! - [`LockRegion`] holds the soft locks of a read-write region.
//! - [`TimestampRegion`] records the last invalidation time of each region.

mod lock;
mod timestamp;

pub use lock::{Lock, LockRegion};
pub use timestamp::TimestampRegion;

use crate::backend::CacheBackend;
use crate::error::{Error, Result};
use crate::key::{CacheKey, CacheKeyBuilder};
use crate::serialization::{deserialize_from_cache, serialize_for_cache};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// A named region with an optional entry lifetime.
///
/// Every put writes one fully serialized envelope, so a reader sees either the
/// previous entry or the new one. `evict_all` bumps the region's namespace
/// version instead of enumerating keys. The version lives in the backend and
/// is read on every operation, so a bump by any handle (in this process or
/// another one sharing the backend) takes effect immediately.
pub struct DefaultRegion<B: CacheBackend> {
    name: String,
    backend: B,
    lifetime: Option<Duration>,
}

impl<B: CacheBackend> DefaultRegion<B> {
    pub fn new(name: impl Into<String>, backend: B, lifetime: Option<Duration>) -> Self {
        DefaultRegion {
            name: name.into(),
            backend,
            lifetime,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifetime(&self) -> Option<Duration> {
        self.lifetime
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn namespace_version(&self) -> Result<u64> {
        let version = match self
            .backend
            .get(&CacheKeyBuilder::namespace_version_key(&self.name))
            .await?
        {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    Error::InvalidCacheEntry(format!(
                        "unreadable namespace version for region {}",
                        self.name
                    ))
                })?,
            None => 1,
        };
        Ok(version)
    }

    async fn backend_key<K: CacheKey + ?Sized>(&self, key: &K) -> Result<String> {
        let version = self.namespace_version().await?;
        Ok(CacheKeyBuilder::build(&self.name, version, key))
    }

    fn decode<E: DeserializeOwned>(&self, backend_key: &str, bytes: &[u8]) -> Result<Option<E>> {
        match deserialize_from_cache(bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(Error::VersionMismatch { expected, found }) => {
                warn!(
                    "Discarding {} written with schema v{} (current v{})",
                    backend_key, found, expected
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch an entry. Absent and expired entries are `Ok(None)`.
    pub async fn get<K, E>(&self, key: &K) -> Result<Option<E>>
    where
        K: CacheKey + ?Sized,
        E: DeserializeOwned,
    {
        let backend_key = self.backend_key(key).await?;
        match self.backend.get(&backend_key).await? {
            Some(bytes) => {
                let entry = self.decode(&backend_key, &bytes)?;
                if entry.is_none() {
                    self.backend.delete(&backend_key).await?;
                }
                Ok(entry)
            }
            None => Ok(None),
        }
    }

    /// Fetch several entries at once, all or nothing.
    ///
    /// Returns `Ok(None)` if any key misses, so callers never see a partial result.
    pub async fn get_multiple<K, E>(&self, keys: &[K]) -> Result<Option<Vec<E>>>
    where
        K: CacheKey,
        E: DeserializeOwned,
    {
        if keys.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let version = self.namespace_version().await?;
        let backend_keys: Vec<String> = keys
            .iter()
            .map(|k| CacheKeyBuilder::build(&self.name, version, k))
            .collect();
        let refs: Vec<&str> = backend_keys.iter().map(String::as_str).collect();

        let values = self.backend.mget(&refs).await?;
        let mut entries = Vec::with_capacity(values.len());
        for (backend_key, value) in backend_keys.iter().zip(values) {
            let Some(bytes) = value else {
                debug!("✗ {} missing from multi-get on {}", backend_key, self.name);
                return Ok(None);
            };
            match self.decode(backend_key, &bytes)? {
                Some(entry) => entries.push(entry),
                None => return Ok(None),
            }
        }
        Ok(Some(entries))
    }

    pub async fn contains<K: CacheKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let backend_key = self.backend_key(key).await?;
        self.backend.exists(&backend_key).await
    }

    /// Store an entry with the region lifetime.
    pub async fn put<K, E>(&self, key: &K, entry: &E) -> Result<()>
    where
        K: CacheKey + ?Sized,
        E: Serialize + ?Sized,
    {
        self.put_with_lifetime(key, entry, self.lifetime).await
    }

    /// Store an entry with an explicit lifetime (`None` = never expires).
    pub async fn put_with_lifetime<K, E>(
        &self,
        key: &K,
        entry: &E,
        lifetime: Option<Duration>,
    ) -> Result<()>
    where
        K: CacheKey + ?Sized,
        E: Serialize + ?Sized,
    {
        let bytes = serialize_for_cache(entry)?;
        let backend_key = self.backend_key(key).await?;
        self.backend.set(&backend_key, bytes, lifetime).await?;
        debug!("✓ PUT {} into region {}", key, self.name);
        Ok(())
    }

    pub async fn evict<K: CacheKey + ?Sized>(&self, key: &K) -> Result<()> {
        let backend_key = self.backend_key(key).await?;
        self.backend.delete(&backend_key).await?;
        debug!("✓ EVICT {} from region {}", key, self.name);
        Ok(())
    }

    /// Make every entry of this region unreachable.
    pub async fn evict_all(&self) -> Result<()> {
        let next = self.namespace_version().await? + 1;
        self.backend
            .set(
                &CacheKeyBuilder::namespace_version_key(&self.name),
                next.to_string().into_bytes(),
                None,
            )
            .await?;
        info!("✓ Region {} evicted (namespace v{})", self.name, next);
        Ok(())
    }
}

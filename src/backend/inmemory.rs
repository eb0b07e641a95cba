//! In-memory cache backend on top of `DashMap`.

use super::CacheBackend;
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// Thread-safe in-process backend with lazy expiry.
///
/// Expired values are dropped when they are next read; there is no background
/// sweep. Clones share the same store.
///
/// # Example
///
/// ```
/// # use orm_cache::backend::{CacheBackend, InMemoryBackend};
/// # use orm_cache::error::Result;
/// # async fn example() -> Result<()> {
/// let backend = InMemoryBackend::new();
/// backend.set("key", b"value".to_vec(), None).await?;
/// assert_eq!(backend.get("key").await?, Some(b"value".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, expired ones included until they are read.
    pub async fn len(&self) -> usize {
        self.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Drop every expired value now. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, v| !v.is_expired());
        before - self.store.len()
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let expired = match self.store.get(key) {
            Some(value) if !value.is_expired() => {
                trace!("InMemory GET {} -> HIT", key);
                return Ok(Some(value.data.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.store.remove_if(key, |_, v| v.is_expired());
            trace!("InMemory GET {} -> EXPIRED", key);
        } else {
            trace!("InMemory GET {} -> MISS", key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.store.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at,
            },
        );
        trace!("InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        trace!("InMemory DELETE {}", key);
        Ok(())
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        debug!("✓ InMemory MGET {} keys", keys.len());
        Ok(values)
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory CLEAR_ALL executed - all cache cleared!");
        Ok(())
    }
}

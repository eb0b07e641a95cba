//! Cache backend implementations.
//!
//! A backend is the physical key-value store behind every region. Regions only
//! ever talk to it through [`CacheBackend`]; keys are already namespaced and
//! values are opaque envelopes (see [`crate::serialization`]).

#[cfg(feature = "inmemory")]
mod inmemory;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryBackend;

use crate::error::Result;
use std::time::Duration;

/// Contract of a physical cache store.
///
/// Implementations are cheap handles (`Clone`) shared by every region. Each
/// individual call must be atomic from the caller's point of view; no
/// multi-key transaction is expected.
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Clone + Send + Sync + 'static {
    /// Fetch a value. Expired values are misses.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Fetch several values, preserving input order.
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Remove every value from the store.
    async fn clear_all(&self) -> Result<()>;
}

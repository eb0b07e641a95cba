//! Soft locks for read-write regions.

use super::DefaultRegion;
use crate::backend::CacheBackend;
use crate::clock;
use crate::error::Result;
use crate::key::CacheKey;
use crate::observability::CacheMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A soft lock: "this key is mid-transaction, do not trust cached reads".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub token: String,
    /// Acquisition time in microseconds (see [`crate::clock`]).
    pub time: u64,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            token: Uuid::new_v4().to_string(),
            time: clock::now_micros(),
        }
    }

    pub fn is_expired(&self, lifetime: Duration) -> bool {
        self.time.saturating_add(lifetime.as_micros() as u64) <= clock::now_micros()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Companion region holding the soft locks of a read-write region.
///
/// Locks never block: acquiring a key that is already locked hands out a
/// fresh token that is not stored, and only the stored token can release the
/// lock. Locks expire after the lock lifetime, both through the backend TTL
/// and through the lock's own timestamp.
pub struct LockRegion<B: CacheBackend> {
    locks: DefaultRegion<B>,
    lock_lifetime: Duration,
    metrics: Arc<dyn CacheMetrics>,
}

impl<B: CacheBackend> LockRegion<B> {
    /// Lock region companion of the region `name`, stored as `"{name}.lock"`.
    pub fn new(
        name: &str,
        backend: B,
        lock_lifetime: Duration,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Self {
        LockRegion {
            locks: DefaultRegion::new(format!("{}.lock", name), backend, Some(lock_lifetime)),
            lock_lifetime,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        self.locks.name()
    }

    pub fn lock_lifetime(&self) -> Duration {
        self.lock_lifetime
    }

    async fn live_lock<K: CacheKey + ?Sized>(&self, key: &K) -> Result<Option<Lock>> {
        Ok(self
            .locks
            .get::<K, Lock>(key)
            .await?
            .filter(|lock| !lock.is_expired(self.lock_lifetime)))
    }

    /// Acquire a lock for `key`. Never waits.
    pub async fn lock<K: CacheKey + ?Sized>(&self, key: &K) -> Result<Lock> {
        let lock = Lock::new();
        if self.live_lock(key).await?.is_some() {
            debug!("Key {} already locked in {}; issuing unstored token", key, self.name());
            return Ok(lock);
        }

        self.locks.put(key, &lock).await?;
        debug!("✓ LOCK {} in {}", key, self.name());
        Ok(lock)
    }

    /// Release the lock for `key` if `lock` owns it.
    ///
    /// Returns `false` (and counts a lock mismatch) when no lock is held or the
    /// token differs; this happens in normal operation when transactions
    /// overlap.
    pub async fn unlock<K: CacheKey + ?Sized>(&self, key: &K, lock: &Lock) -> Result<bool> {
        match self.live_lock(key).await? {
            Some(current) if current.token == lock.token => {
                self.locks.evict(key).await?;
                debug!("✓ UNLOCK {} in {}", key, self.name());
                Ok(true)
            }
            _ => {
                debug!("✗ Stale unlock of {} in {} ignored", key, self.name());
                self.metrics
                    .record_lock_mismatch(self.name(), &key.cache_id());
                Ok(false)
            }
        }
    }

    /// Whether `key` is locked by someone other than the holder of `lock`.
    pub async fn is_locked<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        lock: Option<&Lock>,
    ) -> Result<bool> {
        Ok(match (self.live_lock(key).await?, lock) {
            (None, _) => false,
            (Some(current), Some(own)) => current.token != own.token,
            (Some(_), None) => true,
        })
    }

    /// Whether any of `keys` carries a live lock.
    pub async fn any_locked<K: CacheKey>(&self, keys: &[K]) -> Result<bool> {
        for key in keys {
            if self.live_lock(key).await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remaining lifetime of the live lock on `key`.
    pub async fn timeout<K: CacheKey + ?Sized>(&self, key: &K) -> Result<Option<Duration>> {
        Ok(self.live_lock(key).await?.map(|lock| {
            let held = Duration::from_micros(clock::now_micros().saturating_sub(lock.time));
            self.lock_lifetime.saturating_sub(held)
        }))
    }

    /// Drop every lock of this region.
    pub async fn clear(&self) -> Result<()> {
        self.locks.evict_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::key::EntityCacheKey;
    use crate::observability::StatisticsMetrics;
    use crate::value::Identifier;

    fn key() -> EntityCacheKey {
        EntityCacheKey::new("Order", Identifier::single("id", 42)).unwrap()
    }

    fn lock_region(metrics: Arc<StatisticsMetrics>) -> LockRegion<InMemoryBackend> {
        LockRegion::new(
            "orders",
            InMemoryBackend::new(),
            Duration::from_secs(60),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let locks = lock_region(Arc::new(StatisticsMetrics::new()));
        let lock = locks.lock(&key()).await.unwrap();

        assert!(locks.is_locked(&key(), None).await.unwrap());
        assert!(!locks.is_locked(&key(), Some(&lock)).await.unwrap());

        assert!(locks.unlock(&key(), &lock).await.unwrap());
        assert!(!locks.is_locked(&key(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_acquirer_gets_unstored_token() {
        let metrics = Arc::new(StatisticsMetrics::new());
        let locks = lock_region(metrics.clone());

        let first = locks.lock(&key()).await.unwrap();
        let second = locks.lock(&key()).await.unwrap();
        assert_ne!(first.token, second.token);

        // The second holder cannot release the first holder's lock.
        assert!(!locks.unlock(&key(), &second).await.unwrap());
        assert!(locks.is_locked(&key(), Some(&second)).await.unwrap());
        assert_eq!(metrics.lock_mismatch_count(), 1);

        assert!(locks.unlock(&key(), &first).await.unwrap());
        assert!(!locks.is_locked(&key(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_a_mismatch() {
        let metrics = Arc::new(StatisticsMetrics::new());
        let locks = lock_region(metrics.clone());

        assert!(!locks.unlock(&key(), &Lock::new()).await.unwrap());
        assert_eq!(metrics.region("orders.lock").lock_mismatches, 1);
    }

    #[tokio::test]
    async fn test_timeout() {
        let locks = lock_region(Arc::new(StatisticsMetrics::new()));
        assert!(locks.timeout(&key()).await.unwrap().is_none());

        locks.lock(&key()).await.unwrap();
        let remaining = locks.timeout(&key()).await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn test_lock_expiry_uses_timestamp() {
        let lock = Lock {
            token: "t".to_string(),
            time: clock::now_micros() - 2_000_000,
        };
        assert!(lock.is_expired(Duration::from_secs(1)));
        assert!(!lock.is_expired(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_clear_drops_all_locks() {
        let locks = lock_region(Arc::new(StatisticsMetrics::new()));
        locks.lock(&key()).await.unwrap();
        locks.clear().await.unwrap();
        assert!(!locks.is_locked(&key(), None).await.unwrap());
    }
}

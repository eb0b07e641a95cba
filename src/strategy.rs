//! Concurrency strategies layered over a region.
//!
//! One [`RegionStrategy`] wraps every entity, collection and query region and
//! decides, according to its [`CacheUsage`], when puts and removes are allowed
//! relative to in-flight transactions:
//!
//! | usage                  | population put         | after commit                 | locks |
//! |------------------------|------------------------|------------------------------|-------|
//! | `ReadOnly`             | first write wins       | first write wins             | no    |
//! | `NonstrictReadWrite`   | overwrite              | overwrite + invalidate       | no    |
//! | `ReadWrite`            | skipped while locked   | put with token check, unlock | yes   |

use crate::backend::CacheBackend;
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::metadata::CacheUsage;
use crate::observability::CacheMetrics;
use crate::region::{DefaultRegion, Lock, LockRegion, TimestampRegion};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A region together with the concurrency strategy guarding it.
pub struct RegionStrategy<B: CacheBackend> {
    usage: CacheUsage,
    region: DefaultRegion<B>,
    locks: Option<LockRegion<B>>,
    timestamps: Arc<TimestampRegion<B>>,
    metrics: Arc<dyn CacheMetrics>,
}

impl<B: CacheBackend> RegionStrategy<B> {
    /// Wrap `region`. Read-write strategies get a companion lock region.
    pub fn new(
        usage: CacheUsage,
        region: DefaultRegion<B>,
        lock_lifetime: Duration,
        timestamps: Arc<TimestampRegion<B>>,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Self {
        let locks = match usage {
            CacheUsage::ReadWrite => Some(LockRegion::new(
                region.name(),
                region.backend().clone(),
                lock_lifetime,
                metrics.clone(),
            )),
            CacheUsage::ReadOnly | CacheUsage::NonstrictReadWrite => None,
        };

        RegionStrategy {
            usage,
            region,
            locks,
            timestamps,
            metrics,
        }
    }

    pub fn usage(&self) -> CacheUsage {
        self.usage
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn region(&self) -> &DefaultRegion<B> {
        &self.region
    }

    pub fn lock_region(&self) -> Option<&LockRegion<B>> {
        self.locks.as_ref()
    }

    /// Fetch an entry. Keys under a live soft lock read as misses.
    pub async fn get<K, E>(&self, key: &K) -> Result<Option<E>>
    where
        K: CacheKey + ?Sized,
        E: DeserializeOwned,
    {
        let timer = Instant::now();

        if let Some(locks) = &self.locks {
            if locks.is_locked(key, None).await? {
                debug!("✗ {} is locked in {} (treated as miss)", key, self.name());
                self.metrics
                    .record_miss(self.name(), &key.cache_id(), timer.elapsed());
                return Ok(None);
            }
        }

        let entry = self.region.get(key).await?;
        match entry {
            Some(_) => {
                debug!("✓ Cache hit {} in {}", key, self.name());
                self.metrics
                    .record_hit(self.name(), &key.cache_id(), timer.elapsed());
            }
            None => {
                debug!("✗ Cache miss {} in {}", key, self.name());
                self.metrics
                    .record_miss(self.name(), &key.cache_id(), timer.elapsed());
            }
        }
        Ok(entry)
    }

    /// Fetch several entries, all or nothing. A locked key fails the whole lookup.
    pub async fn get_multiple<K, E>(&self, keys: &[K]) -> Result<Option<Vec<E>>>
    where
        K: CacheKey,
        E: DeserializeOwned,
    {
        let timer = Instant::now();
        let label = format!("{} keys", keys.len());

        if let Some(locks) = &self.locks {
            if locks.any_locked(keys).await? {
                debug!("✗ Multi-get on {} hit a locked key", self.name());
                self.metrics.record_miss(self.name(), &label, timer.elapsed());
                return Ok(None);
            }
        }

        let entries = self.region.get_multiple(keys).await?;
        match entries {
            Some(_) => self.metrics.record_hit(self.name(), &label, timer.elapsed()),
            None => self.metrics.record_miss(self.name(), &label, timer.elapsed()),
        }
        Ok(entries)
    }

    pub async fn contains<K: CacheKey + ?Sized>(&self, key: &K) -> Result<bool> {
        self.region.contains(key).await
    }

    /// Populate the cache with data just read from the database.
    ///
    /// Returns whether the entry was written.
    ///
    /// # Errors
    /// `Error::InvalidatedEntry` when a read-only region already holds a
    /// different entry for `key`.
    pub async fn put<K, E>(&self, key: &K, entry: &E) -> Result<bool>
    where
        K: CacheKey + ?Sized,
        E: Serialize + DeserializeOwned + PartialEq,
    {
        match self.usage {
            CacheUsage::ReadOnly => self.put_read_only(key, entry).await,
            CacheUsage::NonstrictReadWrite => {
                self.write(key, entry).await?;
                Ok(true)
            }
            CacheUsage::ReadWrite => {
                if self.is_locked(key, None).await? {
                    debug!("Skipping put of locked {} in {}", key, self.name());
                    return Ok(false);
                }
                self.write(key, entry).await?;
                Ok(true)
            }
        }
    }

    /// Acquire a soft lock before a transaction modifies `key`.
    ///
    /// Only read-write strategies lock; the others return `None`.
    pub async fn lock<K: CacheKey + ?Sized>(&self, key: &K) -> Result<Option<Lock>> {
        match &self.locks {
            Some(locks) => Ok(Some(locks.lock(key).await?)),
            None => Ok(None),
        }
    }

    /// Write `entry` after the owning transaction committed.
    ///
    /// Read-write: the put is refused (and the stale entry evicted) when
    /// another token holds the lock; the caller's lock is released either way.
    pub async fn commit<K, E>(&self, key: &K, entry: &E, lock: Option<&Lock>) -> Result<bool>
    where
        K: CacheKey + ?Sized,
        E: Serialize + DeserializeOwned + PartialEq,
    {
        match self.usage {
            CacheUsage::ReadOnly => self.put_read_only(key, entry).await,
            CacheUsage::NonstrictReadWrite => {
                self.write(key, entry).await?;
                self.invalidate().await?;
                Ok(true)
            }
            CacheUsage::ReadWrite => {
                let written = if self.is_locked(key, lock).await? {
                    debug!(
                        "✗ {} locked by another transaction in {}; evicting",
                        key,
                        self.name()
                    );
                    self.region.evict(key).await?;
                    false
                } else {
                    self.write(key, entry).await?;
                    true
                };
                self.release(key, lock).await?;
                self.invalidate().await?;
                Ok(written)
            }
        }
    }

    /// Abandon a transactional write: release the lock, leave the entry as is.
    pub async fn rollback<K: CacheKey + ?Sized>(&self, key: &K, lock: Option<&Lock>) -> Result<()> {
        self.release(key, lock).await
    }

    /// Remove `key` after a committed delete (or administratively when `lock` is `None`).
    pub async fn remove<K: CacheKey + ?Sized>(&self, key: &K, lock: Option<&Lock>) -> Result<()> {
        self.region.evict(key).await?;
        self.release(key, lock).await?;
        self.invalidate().await
    }

    pub async fn evict<K: CacheKey + ?Sized>(&self, key: &K) -> Result<()> {
        self.remove(key, None).await
    }

    pub async fn evict_all(&self) -> Result<()> {
        self.region.evict_all().await?;
        self.invalidate().await
    }

    /// Put honoring the given lifetime instead of the region's.
    pub(crate) async fn put_with_lifetime<K, E>(
        &self,
        key: &K,
        entry: &E,
        lifetime: Option<Duration>,
    ) -> Result<()>
    where
        K: CacheKey + ?Sized,
        E: Serialize,
    {
        self.region.put_with_lifetime(key, entry, lifetime).await?;
        self.metrics.record_put(self.name(), &key.cache_id());
        Ok(())
    }

    async fn put_read_only<K, E>(&self, key: &K, entry: &E) -> Result<bool>
    where
        K: CacheKey + ?Sized,
        E: Serialize + DeserializeOwned + PartialEq,
    {
        match self.region.get::<K, E>(key).await? {
            Some(existing) if existing == *entry => Ok(false),
            Some(_) => {
                let err = Error::InvalidatedEntry {
                    region: self.name().to_string(),
                    key: key.cache_id(),
                };
                self.metrics.record_error(&key.cache_id(), &err.to_string());
                Err(err)
            }
            None => {
                self.write(key, entry).await?;
                Ok(true)
            }
        }
    }

    async fn write<K, E>(&self, key: &K, entry: &E) -> Result<()>
    where
        K: CacheKey + ?Sized,
        E: Serialize,
    {
        self.region.put(key, entry).await?;
        self.metrics.record_put(self.name(), &key.cache_id());
        Ok(())
    }

    async fn is_locked<K: CacheKey + ?Sized>(&self, key: &K, lock: Option<&Lock>) -> Result<bool> {
        match &self.locks {
            Some(locks) => locks.is_locked(key, lock).await,
            None => Ok(false),
        }
    }

    async fn release<K: CacheKey + ?Sized>(&self, key: &K, lock: Option<&Lock>) -> Result<()> {
        if let (Some(locks), Some(lock)) = (&self.locks, lock) {
            locks.unlock(key, lock).await?;
        }
        Ok(())
    }

    /// Record an invalidation timestamp. Read-only regions never invalidate.
    async fn invalidate(&self) -> Result<()> {
        if self.usage != CacheUsage::ReadOnly {
            self.timestamps.update(self.name()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::key::EntityCacheKey;
    use crate::observability::StatisticsMetrics;
    use crate::value::Identifier;

    struct Fixture {
        strategy: RegionStrategy<InMemoryBackend>,
        timestamps: Arc<TimestampRegion<InMemoryBackend>>,
        metrics: Arc<StatisticsMetrics>,
    }

    fn fixture(usage: CacheUsage) -> Fixture {
        let backend = InMemoryBackend::new();
        let timestamps = Arc::new(TimestampRegion::new("timestamps", backend.clone()));
        let metrics = Arc::new(StatisticsMetrics::new());
        let strategy = RegionStrategy::new(
            usage,
            DefaultRegion::new("orders", backend, None),
            Duration::from_secs(60),
            timestamps.clone(),
            metrics.clone(),
        );
        Fixture {
            strategy,
            timestamps,
            metrics,
        }
    }

    fn key() -> EntityCacheKey {
        EntityCacheKey::new("Order", Identifier::single("id", 42)).unwrap()
    }

    async fn get(strategy: &RegionStrategy<InMemoryBackend>) -> Option<String> {
        strategy.get::<_, String>(&key()).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_only_first_write_wins() {
        let f = fixture(CacheUsage::ReadOnly);
        assert!(f.strategy.put(&key(), &"v1".to_string()).await.unwrap());
        assert!(!f.strategy.put(&key(), &"v1".to_string()).await.unwrap());

        let err = f.strategy.put(&key(), &"v2".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidatedEntry { .. }));
        assert_eq!(get(&f.strategy).await.as_deref(), Some("v1"));

        let err = f
            .strategy
            .commit(&key(), &"v3".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidatedEntry { .. }));
        assert_eq!(get(&f.strategy).await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_read_only_remove_never_invalidates() {
        let f = fixture(CacheUsage::ReadOnly);
        f.strategy.put(&key(), &"v1".to_string()).await.unwrap();
        assert!(f.strategy.lock(&key()).await.unwrap().is_none());

        f.strategy.evict(&key()).await.unwrap();
        assert!(get(&f.strategy).await.is_none());
        f.strategy.evict_all().await.unwrap();
        assert_eq!(f.timestamps.get("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nonstrict_last_write_wins() {
        let f = fixture(CacheUsage::NonstrictReadWrite);
        assert!(f.strategy.put(&key(), &"first".to_string()).await.unwrap());
        assert!(f.strategy.put(&key(), &"second".to_string()).await.unwrap());
        assert_eq!(get(&f.strategy).await.as_deref(), Some("second"));

        // Population does not invalidate dependent queries.
        assert_eq!(f.timestamps.get("orders").await.unwrap(), None);

        f.strategy
            .commit(&key(), &"third".to_string(), None)
            .await
            .unwrap();
        assert_eq!(get(&f.strategy).await.as_deref(), Some("third"));
        assert!(f.timestamps.get("orders").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_write_lock_commit_unlock() {
        let f = fixture(CacheUsage::ReadWrite);
        f.strategy.put(&key(), &"old".to_string()).await.unwrap();

        let lock = f.strategy.lock(&key()).await.unwrap().expect("lock");
        // Stale data is physically present but not served.
        assert!(get(&f.strategy).await.is_none());
        assert!(f.strategy.region().contains(&key()).await.unwrap());

        assert!(f
            .strategy
            .commit(&key(), &"new".to_string(), Some(&lock))
            .await
            .unwrap());
        assert_eq!(get(&f.strategy).await.as_deref(), Some("new"));
        assert!(f.timestamps.get("orders").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_write_rollback_keeps_prior_value() {
        let f = fixture(CacheUsage::ReadWrite);
        f.strategy.put(&key(), &"old".to_string()).await.unwrap();

        let lock = f.strategy.lock(&key()).await.unwrap().expect("lock");
        f.strategy.rollback(&key(), Some(&lock)).await.unwrap();

        assert_eq!(get(&f.strategy).await.as_deref(), Some("old"));
        assert_eq!(f.timestamps.get("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_write_population_skipped_while_locked() {
        let f = fixture(CacheUsage::ReadWrite);
        let lock = f.strategy.lock(&key()).await.unwrap().expect("lock");

        assert!(!f.strategy.put(&key(), &"loaded".to_string()).await.unwrap());
        f.strategy.rollback(&key(), Some(&lock)).await.unwrap();
        assert!(f.strategy.put(&key(), &"loaded".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_write_overlapping_writers() {
        let f = fixture(CacheUsage::ReadWrite);
        f.strategy.put(&key(), &"v0".to_string()).await.unwrap();

        let first = f.strategy.lock(&key()).await.unwrap().expect("lock");
        let second = f.strategy.lock(&key()).await.unwrap().expect("lock");

        // The second writer does not own the lock: its put is refused and the
        // stale entry evicted.
        assert!(!f
            .strategy
            .commit(&key(), &"v2".to_string(), Some(&second))
            .await
            .unwrap());
        assert_eq!(f.metrics.lock_mismatch_count(), 1);
        assert!(get(&f.strategy).await.is_none());

        assert!(f
            .strategy
            .commit(&key(), &"v1".to_string(), Some(&first))
            .await
            .unwrap());
        assert_eq!(get(&f.strategy).await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_read_write_remove_releases_lock() {
        let f = fixture(CacheUsage::ReadWrite);
        f.strategy.put(&key(), &"v".to_string()).await.unwrap();

        let lock = f.strategy.lock(&key()).await.unwrap().expect("lock");
        f.strategy.remove(&key(), Some(&lock)).await.unwrap();

        let locks = f.strategy.lock_region().expect("lock region");
        assert!(!locks.is_locked(&key(), None).await.unwrap());
        assert!(get(&f.strategy).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_write_key_readable_after_lock_expires() {
        let f = fixture(CacheUsage::ReadWrite);
        f.strategy.put(&key(), &"v1".to_string()).await.unwrap();

        // the holder never commits nor rolls back
        let _lock = f.strategy.lock(&key()).await.unwrap().unwrap();
        assert!(get(&f.strategy).await.is_none());
        assert!(!f.strategy.put(&key(), &"v2".to_string()).await.unwrap());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(get(&f.strategy).await.is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(get(&f.strategy).await.as_deref(), Some("v1"));
        assert!(f.strategy.put(&key(), &"v2".to_string()).await.unwrap());
        assert_eq!(get(&f.strategy).await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_get_multiple_respects_locks() {
        let f = fixture(CacheUsage::ReadWrite);
        let other = EntityCacheKey::new("Order", Identifier::single("id", 43)).unwrap();
        f.strategy.put(&key(), &"a".to_string()).await.unwrap();
        f.strategy.put(&other, &"b".to_string()).await.unwrap();

        let keys = vec![key(), other.clone()];
        let all: Option<Vec<String>> = f.strategy.get_multiple(&keys).await.unwrap();
        assert_eq!(all, Some(vec!["a".to_string(), "b".to_string()]));

        let _lock = f.strategy.lock(&other).await.unwrap();
        let locked: Option<Vec<String>> = f.strategy.get_multiple(&keys).await.unwrap();
        assert!(locked.is_none());
    }

    #[tokio::test]
    async fn test_metrics_record_hits_and_misses() {
        let f = fixture(CacheUsage::NonstrictReadWrite);
        assert!(get(&f.strategy).await.is_none());
        f.strategy.put(&key(), &"v".to_string()).await.unwrap();
        assert!(get(&f.strategy).await.is_some());

        let stats = f.metrics.region("orders");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.puts, 1);
    }
}

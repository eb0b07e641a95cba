//! Invalidation timestamps per region.

use super::DefaultRegion;
use crate::backend::CacheBackend;
use crate::entry::TimestampCacheEntry;
use crate::error::Result;
use crate::key::TimestampCacheKey;

/// Records when each region last changed.
///
/// Query results depending on a region are stale once that region's
/// timestamp is later than the result's own time.
pub struct TimestampRegion<B: CacheBackend> {
    region: DefaultRegion<B>,
}

impl<B: CacheBackend> TimestampRegion<B> {
    pub fn new(name: impl Into<String>, backend: B) -> Self {
        TimestampRegion {
            region: DefaultRegion::new(name, backend, None),
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Record an invalidation of `region` now. Returns the recorded time.
    pub async fn update(&self, region: &str) -> Result<u64> {
        let entry = TimestampCacheEntry::now();
        self.region
            .put(&TimestampCacheKey::new(region), &entry)
            .await?;
        debug!("✓ Region {} invalidated at {}", region, entry.time);
        Ok(entry.time)
    }

    /// Last invalidation time of `region`, if any.
    pub async fn get(&self, region: &str) -> Result<Option<u64>> {
        Ok(self
            .region
            .get::<_, TimestampCacheEntry>(&TimestampCacheKey::new(region))
            .await?
            .map(|entry| entry.time))
    }

    pub async fn clear(&self) -> Result<()> {
        self.region.evict_all().await
    }
}

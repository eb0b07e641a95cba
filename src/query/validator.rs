use crate::backend::CacheBackend;
use crate::clock;
use crate::entry::QueryCacheEntry;
use crate::error::Result;
use crate::key::QueryCacheKey;
use crate::region::TimestampRegion;
use std::sync::Arc;

/// Decides whether a cached query result may still be served.
#[allow(async_fn_in_trait)]
pub trait QueryCacheValidator {
    /// `regions` are the names of the entity regions the result depends on.
    async fn is_valid(
        &self,
        key: &QueryCacheKey,
        entry: &QueryCacheEntry,
        regions: &[String],
    ) -> Result<bool>;
}

/// Invalidates results older than their lifetime or than the last write to
/// any region they depend on.
pub struct TimestampQueryCacheValidator<B: CacheBackend> {
    timestamps: Arc<TimestampRegion<B>>,
}

impl<B: CacheBackend> TimestampQueryCacheValidator<B> {
    pub fn new(timestamps: Arc<TimestampRegion<B>>) -> Self {
        TimestampQueryCacheValidator { timestamps }
    }
}

impl<B: CacheBackend> QueryCacheValidator for TimestampQueryCacheValidator<B> {
    async fn is_valid(
        &self,
        key: &QueryCacheKey,
        entry: &QueryCacheEntry,
        regions: &[String],
    ) -> Result<bool> {
        if let Some(ttl) = key.time_to_live_ms {
            let expires = entry.time.saturating_add(ttl.saturating_mul(1_000));
            if expires < clock::now_micros() {
                debug!("✗ {} expired (lifetime {}ms)", key, ttl);
                return Ok(false);
            }
        }

        for region in regions {
            if let Some(invalidated) = self.timestamps.get(region).await? {
                if invalidated > entry.time {
                    debug!("✗ {} stale: region {} changed after it was cached", key, region);
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

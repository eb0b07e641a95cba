use super::{QueryCacheValidator, ResultRow, ResultSetMapping, TimestampQueryCacheValidator};
use crate::backend::CacheBackend;
use crate::cache::SecondLevelCache;
use crate::entry::{EntityCacheEntry, QueryCacheEntry, QueryCacheRow};
use crate::error::{Error, Result};
use crate::hydrator::{EntityHydrator, HydrationBatch};
use crate::key::{EntityCacheKey, QueryCacheKey};
use crate::strategy::RegionStrategy;
use crate::uow::{HydrationHints, UnitOfWork};
use std::sync::Arc;
use std::time::Duration;

/// Query results stored as entity keys plus scalar rows.
///
/// Entities are stored in their own regions; a query entry only references
/// them, so a single missing entity turns the whole result into a miss.
pub struct QueryCache<'a, B: CacheBackend> {
    cache: &'a SecondLevelCache<B>,
    region: Arc<RegionStrategy<B>>,
    validator: TimestampQueryCacheValidator<B>,
}

impl<'a, B: CacheBackend> QueryCache<'a, B> {
    pub fn new(cache: &'a SecondLevelCache<B>, region: Arc<RegionStrategy<B>>) -> Self {
        QueryCache {
            cache,
            region,
            validator: TimestampQueryCacheValidator::new(cache.timestamps().clone()),
        }
    }

    pub fn region(&self) -> &RegionStrategy<B> {
        &self.region
    }

    /// Entity regions a result shaped by `mapping` depends on.
    fn dependent_regions(&self, mapping: &ResultSetMapping) -> Vec<String> {
        let metadata = self.cache.metadata();
        let mut regions: Vec<String> = mapping
            .referenced_classes()
            .into_iter()
            .filter_map(|class| metadata.get(class))
            .filter(|m| {
                metadata
                    .get(&m.root_name)
                    .map(|root| root.is_cacheable())
                    .unwrap_or_else(|| m.is_cacheable())
            })
            .map(|m| self.cache.entity_region_name(m))
            .collect();
        regions.sort();
        regions.dedup();
        regions
    }

    /// Cached result for `key`, or `None` when absent, stale or incomplete.
    pub async fn get(
        &self,
        key: &QueryCacheKey,
        mapping: &ResultSetMapping,
        uow: &dyn UnitOfWork,
        hints: &HydrationHints,
    ) -> Result<Option<Vec<ResultRow>>> {
        let Some(entry) = self.region.get::<_, QueryCacheEntry>(key).await? else {
            return Ok(None);
        };

        let regions = self.dependent_regions(mapping);
        if !self.validator.is_valid(key, &entry, &regions).await? {
            return Ok(None);
        }

        let rows = match self.hydrate_rows(key, &entry, uow, hints).await {
            Ok(Some(rows)) => rows,
            other => {
                uow.hydration_aborted();
                return other;
            }
        };

        uow.hydration_complete();
        debug!("✓ Query cache hit {} ({} rows)", key, rows.len());
        Ok(Some(rows))
    }

    async fn hydrate_rows(
        &self,
        key: &QueryCacheKey,
        entry: &QueryCacheEntry,
        uow: &dyn UnitOfWork,
        hints: &HydrationHints,
    ) -> Result<Option<Vec<ResultRow>>> {
        let metadata = self.cache.metadata();
        let hydrator = EntityHydrator::new(self.cache);
        let batch = HydrationBatch::default();
        let mut rows = Vec::with_capacity(entry.result.len());

        for row in &entry.result {
            match row {
                QueryCacheRow::Scalar(values) => rows.push(ResultRow::Scalar(values.clone())),
                QueryCacheRow::Entity(entity_key) => {
                    let Some(region) = self.cache.entity_region(&entity_key.entity_class)? else {
                        return Ok(None);
                    };
                    let Some(entity_entry) =
                        region.get::<_, EntityCacheEntry>(entity_key).await?
                    else {
                        debug!("✗ {} references uncached {}", key, entity_key);
                        return Ok(None);
                    };
                    let class_metadata = match metadata.get(&entity_entry.class) {
                        Some(m) => m.clone(),
                        None => metadata.require(&entity_key.entity_class)?.clone(),
                    };
                    match hydrator
                        .load_in_batch(&batch, &class_metadata, entity_key, &entity_entry, uow, hints)
                        .await?
                    {
                        Some(entity) => rows.push(ResultRow::Entity(entity)),
                        None => return Ok(None),
                    }
                }
            }
        }
        Ok(Some(rows))
    }

    /// Store `rows` under `key`.
    ///
    /// Entities go to their own regions first, then the query entry is
    /// written with the key's lifetime (or the region's).
    ///
    /// # Errors
    /// `Error::NonCacheableEntity` when a row holds an entity whose class has
    /// no cache mapping.
    pub async fn put(
        &self,
        key: &QueryCacheKey,
        mapping: &ResultSetMapping,
        rows: &[ResultRow],
    ) -> Result<bool> {
        let metadata = self.cache.metadata();
        let hydrator = EntityHydrator::new(self.cache);
        let mut result = Vec::with_capacity(rows.len());

        for row in rows {
            match row {
                ResultRow::Scalar(values) => result.push(QueryCacheRow::Scalar(values.clone())),
                ResultRow::Entity(entity) => {
                    let class_metadata = metadata.require(entity.class())?;
                    let region = self.cache.entity_region(entity.class())?.ok_or_else(|| {
                        Error::NonCacheableEntity(format!(
                            "query result holds {} which has no cache mapping",
                            entity.class()
                        ))
                    })?;
                    let entity_key = EntityCacheKey::new(
                        class_metadata.root_name.clone(),
                        entity.identifier().clone(),
                    )?;
                    let entry = hydrator.build_cache_entry(class_metadata, &entity_key, entity)?;
                    region.put(&entity_key, &entry).await?;
                    result.push(QueryCacheRow::Entity(entity_key));
                }
            }
        }

        let lifetime = key
            .time_to_live_ms
            .map(Duration::from_millis)
            .or(self.region.region().lifetime());
        self.region
            .put_with_lifetime(key, &QueryCacheEntry::new(result), lifetime)
            .await?;
        debug!(
            "✓ Query cached {} ({} rows, mapping {} classes)",
            key,
            rows.len(),
            mapping.referenced_classes().len()
        );
        Ok(true)
    }

    /// Drop every result of this query region.
    pub async fn clear(&self) -> Result<()> {
        self.region.evict_all().await
    }
}

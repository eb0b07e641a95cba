use crate::backend::CacheBackend;
use crate::builder::QueryBuilder;
use crate::cache::SecondLevelCache;
use crate::error::Result;
use crate::key::EntityCacheKey;
use crate::query::{CachedQuery, ResultRow};
use crate::repository::QueryExecutor;
use crate::uow::{HydrationHints, UnitOfWork};
use std::sync::Arc;
use std::time::Instant;

/// Runs queries through the query cache.
pub struct CachedQueryPersister<'a, B: CacheBackend, X: QueryExecutor> {
    cache: &'a SecondLevelCache<B>,
    executor: X,
}

impl<'a, B: CacheBackend, X: QueryExecutor> CachedQueryPersister<'a, B, X> {
    pub fn new(cache: &'a SecondLevelCache<B>, executor: X) -> Self {
        CachedQueryPersister { cache, executor }
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// Start building a query over `sql`.
    pub fn query(&self, sql: impl Into<String>) -> QueryBuilder<'_, 'a, B, X> {
        QueryBuilder::new(self, sql)
    }

    /// Execute `query`.
    ///
    /// Non-cacheable queries go straight to the executor. Cacheable ones read
    /// the query cache first when the mode reads, and store fresh results when
    /// the mode writes.
    pub async fn execute(&self, query: &CachedQuery, uow: &dyn UnitOfWork) -> Result<Vec<ResultRow>> {
        let timer = Instant::now();
        let mode = query.options.mode;
        let hints = HydrationHints {
            cache_enabled: true,
            refresh: mode.is_refresh(),
        };

        if !query.options.cacheable {
            let rows = self.executor.execute(query).await?;
            return self.manage(rows, uow, &hints);
        }

        let key = query.cache_key()?;
        let queries = self.cache.query_cache(query.options.region.as_deref());
        debug!("» Query {} (mode: {})", key, mode);

        if mode.reads() {
            if let Some(rows) = queries.get(&key, &query.mapping, uow, &hints).await? {
                debug!("✓ Query {} served from cache in {:?}", key, timer.elapsed());
                return Ok(rows);
            }
        }

        let rows = self.executor.execute(query).await?;
        let rows = self.manage(rows, uow, &hints)?;

        if mode.writes() {
            queries.put(&key, &query.mapping, &rows).await?;
        }

        info!(
            "✓ Query {} executed ({} rows) in {:?}",
            key,
            rows.len(),
            timer.elapsed()
        );
        Ok(rows)
    }

    /// Route entity rows through the unit of work.
    ///
    /// # Errors
    /// `Error::MalformedKey` when an entity row has an empty or NULL identifier.
    fn manage(
        &self,
        rows: Vec<ResultRow>,
        uow: &dyn UnitOfWork,
        hints: &HydrationHints,
    ) -> Result<Vec<ResultRow>> {
        let metadata = self.cache.metadata();
        let keyed = rows
            .into_iter()
            .map(|row| match row {
                ResultRow::Entity(entity) => {
                    let root = metadata.root_of(entity.class());
                    let key = EntityCacheKey::new(root, entity.identifier().clone())?;
                    Ok((Some(key), ResultRow::Entity(entity)))
                }
                scalar => Ok((None, scalar)),
            })
            .collect::<Result<Vec<_>>>()?;

        let managed = keyed
            .into_iter()
            .map(|(key, row)| match (key, row) {
                (Some(key), ResultRow::Entity(entity)) => {
                    let entity = Arc::try_unwrap(entity).unwrap_or_else(|shared| (*shared).clone());
                    ResultRow::Entity(uow.create_entity(&key, entity, hints))
                }
                (_, row) => row,
            })
            .collect();
        uow.hydration_complete();
        Ok(managed)
    }
}

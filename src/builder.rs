//! Builder pattern for cacheable queries.

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::mode::CacheMode;
use crate::persister::CachedQueryPersister;
use crate::query::{CachedQuery, ResultRow, ResultSetMapping};
use crate::repository::QueryExecutor;
use crate::uow::UnitOfWork;
use crate::value::Value;
use std::time::Duration;

/// Fluent builder configuring a query's parameters, paging and caching.
///
/// # Example
///
/// ```ignore
/// let rows = persister
///     .query("SELECT o FROM Order o WHERE o.total > ?")
///     .with_mapping(ResultSetMapping::new().entity_result("o", "Order"))
///     .with_param(50)
///     .with_max_results(10)
///     .cacheable(true)
///     .with_lifetime(Duration::from_secs(300))
///     .execute(&uow)
///     .await?;
/// ```
pub struct QueryBuilder<'p, 'a, B: CacheBackend, X: QueryExecutor> {
    persister: &'p CachedQueryPersister<'a, B, X>,
    query: CachedQuery,
}

impl<'p, 'a, B: CacheBackend, X: QueryExecutor> QueryBuilder<'p, 'a, B, X> {
    pub(crate) fn new(persister: &'p CachedQueryPersister<'a, B, X>, sql: impl Into<String>) -> Self {
        QueryBuilder {
            persister,
            query: CachedQuery::new(sql, ResultSetMapping::default()),
        }
    }

    pub fn with_mapping(mut self, mapping: ResultSetMapping) -> Self {
        self.query.mapping = mapping;
        self
    }

    /// Bind the next positional parameter.
    pub fn with_param(mut self, value: impl Into<Value>) -> Self {
        self.query.params.push(value.into());
        self
    }

    pub fn with_first_result(mut self, first: usize) -> Self {
        self.query.first_result = first;
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.query.max_results = Some(max);
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.query.options.cacheable = cacheable;
        self
    }

    /// Store results in the named query region instead of the default one.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.query.options.region = Some(region.into());
        self
    }

    /// Lifetime of this query's cached result.
    ///
    /// Part of the cache key, so the same query with another lifetime is
    /// cached separately.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.query.options.lifetime = Some(lifetime);
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.query.options.mode = mode;
        self
    }

    /// The configured query, without executing it.
    pub fn build(self) -> CachedQuery {
        self.query
    }

    /// Execute the configured query.
    ///
    /// # Errors
    /// - `Error::MalformedKey`: empty SQL on a cacheable query
    /// - `Error::NonCacheableEntity`: a cacheable query returned an entity without cache mapping
    /// - `Error::RepositoryError`: the executor failed
    /// - `Error::BackendError`, codec errors: cache access failed
    pub async fn execute(self, uow: &dyn UnitOfWork) -> Result<Vec<ResultRow>> {
        self.persister.execute(&self.query, uow).await
    }
}

//! Query result caching.

mod cache;
mod validator;

pub use cache::QueryCache;
pub use validator::{QueryCacheValidator, TimestampQueryCacheValidator};

use crate::config::QueryCacheOptions;
use crate::entity::Entity;
use crate::error::Result;
use crate::key::{sha256_hex, QueryCacheKey};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use std::sync::Arc;

/// Shape of a query result: which aliases are entities, which are scalars.
///
/// # Example
///
/// ```
/// use orm_cache::query::ResultSetMapping;
///
/// let rsm = ResultSetMapping::new()
///     .entity_result("o", "Order")
///     .joined_entity("Customer")
///     .scalar_result("line_count");
///
/// let classes: Vec<_> = rsm.referenced_classes().into_iter().collect();
/// assert_eq!(classes, vec!["Customer", "Order"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSetMapping {
    /// Alias -> entity class.
    pub entity_results: BTreeMap<String, String>,
    pub scalar_results: BTreeSet<String>,
    /// Classes fetch-joined into the result without being selected themselves.
    pub joined_classes: BTreeSet<String>,
}

impl ResultSetMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_result(mut self, alias: impl Into<String>, class: impl Into<String>) -> Self {
        self.entity_results.insert(alias.into(), class.into());
        self
    }

    pub fn scalar_result(mut self, column: impl Into<String>) -> Self {
        self.scalar_results.insert(column.into());
        self
    }

    pub fn joined_entity(mut self, class: impl Into<String>) -> Self {
        self.joined_classes.insert(class.into());
        self
    }

    /// Every entity class the result depends on.
    pub fn referenced_classes(&self) -> BTreeSet<&str> {
        self.entity_results
            .values()
            .chain(self.joined_classes.iter())
            .map(String::as_str)
            .collect()
    }

    /// Stable digest of this mapping, part of every query cache key.
    pub fn hash(&self) -> String {
        // BTree collections serialize in a deterministic order
        match serde_json::to_vec(self) {
            Ok(bytes) => sha256_hex(&bytes),
            Err(_) => sha256_hex(format!("{:?}", self).as_bytes()),
        }
    }
}

/// One row of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultRow {
    Entity(Arc<Entity>),
    Scalar(BTreeMap<String, Value>),
}

impl ResultRow {
    pub fn entity(&self) -> Option<&Arc<Entity>> {
        match self {
            ResultRow::Entity(entity) => Some(entity),
            ResultRow::Scalar(_) => None,
        }
    }
}

/// A query as handed to the executor and the query cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub mapping: ResultSetMapping,
    pub first_result: usize,
    pub max_results: Option<usize>,
    pub options: QueryCacheOptions,
}

impl CachedQuery {
    pub fn new(sql: impl Into<String>, mapping: ResultSetMapping) -> Self {
        CachedQuery {
            sql: sql.into(),
            params: Vec::new(),
            mapping,
            first_result: 0,
            max_results: None,
            options: QueryCacheOptions::default(),
        }
    }

    /// # Errors
    /// `Error::MalformedKey` when the SQL text is empty.
    pub fn cache_key(&self) -> Result<QueryCacheKey> {
        QueryCacheKey::new(
            &self.sql,
            self.params.clone(),
            self.mapping.hash(),
            self.first_result,
            self.max_results,
            lifetime_ms(self.options.lifetime),
        )
    }
}

/// A zero lifetime means no per-query expiry; anything shorter than a
/// millisecond rounds up to one.
fn lifetime_ms(lifetime: Option<Duration>) -> Option<u64> {
    lifetime
        .filter(|d| !d.is_zero())
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1))
}

//! Cache entry types: the immutable snapshots stored in regions.

use crate::clock;
use crate::entity::EntityReference;
use crate::error::Result;
use crate::key::EntityCacheKey;
use crate::value::Value;
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored field of an entity entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Scalar column value, copied verbatim.
    Scalar(Value),
    /// To-one association: reference to the target's entry, never its data.
    Association(EntityCacheKey),
    /// To-one association that points at nothing.
    NullAssociation,
}

/// Snapshot of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCacheEntry {
    /// Concrete entity class (may be a subclass of the key's root class).
    pub class: String,
    pub data: BTreeMap<String, FieldValue>,
}

/// Entity data with association references resolved for construction.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEntry {
    pub fields: BTreeMap<String, Value>,
    pub references: BTreeMap<String, Option<EntityReference>>,
}

/// Turns a referenced key into a live reference during hydration.
///
/// `Ok(None)` means the reference is required but unavailable from cache, which
/// turns the whole entry into a miss.
pub trait AssociationResolver {
    fn resolve<'r>(
        &'r self,
        field: &'r str,
        key: &'r EntityCacheKey,
    ) -> LocalBoxFuture<'r, Result<Option<EntityReference>>>;
}

impl EntityCacheEntry {
    pub fn new(class: impl Into<String>, data: BTreeMap<String, FieldValue>) -> Self {
        EntityCacheEntry {
            class: class.into(),
            data,
        }
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        match self.data.get(field) {
            Some(FieldValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn association(&self, field: &str) -> Option<&EntityCacheKey> {
        match self.data.get(field) {
            Some(FieldValue::Association(k)) => Some(k),
            _ => None,
        }
    }

    /// Resolve every association reference of this entry through `resolver`.
    ///
    /// Returns `Ok(None)` as soon as one reference cannot be resolved.
    pub async fn resolve_association_entries<R>(&self, resolver: &R) -> Result<Option<ResolvedEntry>>
    where
        R: AssociationResolver + ?Sized,
    {
        let mut resolved = ResolvedEntry::default();

        for (field, value) in &self.data {
            match value {
                FieldValue::Scalar(v) => {
                    resolved.fields.insert(field.clone(), v.clone());
                }
                FieldValue::NullAssociation => {
                    resolved.references.insert(field.clone(), None);
                }
                FieldValue::Association(key) => match resolver.resolve(field, key).await? {
                    Some(reference) => {
                        resolved.references.insert(field.clone(), Some(reference));
                    }
                    None => {
                        debug!("✗ Association {}.{} -> {} unresolved", self.class, field, key);
                        return Ok(None);
                    }
                },
            }
        }

        Ok(Some(resolved))
    }
}

/// Snapshot of a collection: ordered member keys. Duplicates are legal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCacheEntry {
    pub members: Vec<EntityCacheKey>,
}

impl CollectionCacheEntry {
    pub fn new(members: Vec<EntityCacheKey>) -> Self {
        CollectionCacheEntry { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// One row of a cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryCacheRow {
    Entity(EntityCacheKey),
    Scalar(BTreeMap<String, Value>),
}

/// Cached query result anchored at the time it was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCacheEntry {
    pub result: Vec<QueryCacheRow>,
    /// Microseconds since the epoch (see [`crate::clock`]).
    pub time: u64,
}

impl QueryCacheEntry {
    pub fn new(result: Vec<QueryCacheRow>) -> Self {
        QueryCacheEntry {
            result,
            time: clock::now_micros(),
        }
    }

    pub fn with_time(result: Vec<QueryCacheRow>, time: u64) -> Self {
        QueryCacheEntry { result, time }
    }
}

/// Last invalidation time of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampCacheEntry {
    pub time: u64,
}

impl TimestampCacheEntry {
    pub fn now() -> Self {
        TimestampCacheEntry {
            time: clock::now_micros(),
        }
    }
}

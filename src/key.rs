//! Cache key types and backend key construction.

use crate::error::{Error, Result};
use crate::value::{Identifier, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A value uniquely identifying a cacheable unit inside a region.
pub trait CacheKey: fmt::Display + Send + Sync {
    /// Stable, deterministic id of this key within its region.
    fn cache_id(&self) -> String;
}

/// Builds namespaced backend keys.
///
/// Format: `"{region}[{version}]:{id}"`. Bumping the namespace version
/// makes every key written under the previous version unreachable.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    pub fn build<K: CacheKey + ?Sized>(region: &str, version: u64, key: &K) -> String {
        format!("{}[{}]:{}", region, version, key.cache_id())
    }

    /// Key under which a region stores its namespace version.
    pub fn namespace_version_key(region: &str) -> String {
        format!("{}:__namespace_version", region)
    }
}

/// Identifies a cached entity: root entity class + identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityCacheKey {
    pub entity_class: String,
    pub identifier: Identifier,
}

impl EntityCacheKey {
    /// # Errors
    /// `Error::MalformedKey` when the class name or the identifier is empty.
    pub fn new(entity_class: impl Into<String>, identifier: Identifier) -> Result<Self> {
        let entity_class = entity_class.into();
        if entity_class.is_empty() {
            return Err(Error::MalformedKey(
                "entity class name must not be empty".to_string(),
            ));
        }
        validate_identifier(&entity_class, &identifier)?;
        Ok(EntityCacheKey {
            entity_class,
            identifier,
        })
    }
}

impl CacheKey for EntityCacheKey {
    fn cache_id(&self) -> String {
        format!("{}_{}", self.entity_class, identifier_digest(&self.identifier))
    }
}

impl fmt::Display for EntityCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_class, self.identifier)
    }
}

/// Identifies a cached collection: owning root class + association + owner identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionCacheKey {
    pub entity_class: String,
    pub association: String,
    pub owner_identifier: Identifier,
}

impl CollectionCacheKey {
    /// # Errors
    /// `Error::MalformedKey` when any component is empty.
    pub fn new(
        entity_class: impl Into<String>,
        association: impl Into<String>,
        owner_identifier: Identifier,
    ) -> Result<Self> {
        let entity_class = entity_class.into();
        let association = association.into();
        if entity_class.is_empty() || association.is_empty() {
            return Err(Error::MalformedKey(format!(
                "collection key needs an owner class and an association (got {:?}, {:?})",
                entity_class, association
            )));
        }
        validate_identifier(&entity_class, &owner_identifier)?;
        Ok(CollectionCacheKey {
            entity_class,
            association,
            owner_identifier,
        })
    }

    /// Key of the owning entity.
    pub fn owner_key(&self) -> EntityCacheKey {
        EntityCacheKey {
            entity_class: self.entity_class.clone(),
            identifier: self.owner_identifier.clone(),
        }
    }
}

impl CacheKey for CollectionCacheKey {
    fn cache_id(&self) -> String {
        format!(
            "{}_{}__{}",
            self.entity_class,
            identifier_digest(&self.owner_identifier),
            self.association
        )
    }
}

impl fmt::Display for CollectionCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.entity_class, self.owner_identifier, self.association
        )
    }
}

/// Identifies a cached query result.
///
/// The id is a SHA-256 digest over every component, computed once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCacheKey {
    pub sql_statement_hash: String,
    pub first_result: usize,
    pub max_results: Option<usize>,
    /// Lifetime override in milliseconds. `None` leaves expiry to the region.
    pub time_to_live_ms: Option<u64>,
    pub result_set_mapping_hash: String,
    pub params: Vec<Value>,
    hash: String,
}

impl QueryCacheKey {
    /// # Errors
    /// `Error::MalformedKey` when the SQL text is empty.
    pub fn new(
        sql: &str,
        params: Vec<Value>,
        result_set_mapping_hash: impl Into<String>,
        first_result: usize,
        max_results: Option<usize>,
        time_to_live_ms: Option<u64>,
    ) -> Result<Self> {
        if sql.trim().is_empty() {
            return Err(Error::MalformedKey(
                "query cache key needs SQL text".to_string(),
            ));
        }

        let mut key = QueryCacheKey {
            sql_statement_hash: sha256_hex(sql.as_bytes()),
            first_result,
            max_results,
            time_to_live_ms,
            result_set_mapping_hash: result_set_mapping_hash.into(),
            params,
            hash: String::new(),
        };

        let canonical = serde_json::to_vec(&key)
            .map_err(|e| Error::MalformedKey(format!("unencodable query parameters: {}", e)))?;
        key.hash = sha256_hex(&canonical);
        Ok(key)
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl CacheKey for QueryCacheKey {
    fn cache_id(&self) -> String {
        self.hash.clone()
    }
}

impl fmt::Display for QueryCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query:{}", &self.hash[..self.hash.len().min(12)])
    }
}

/// Key of a region's invalidation timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampCacheKey {
    pub region: String,
}

impl TimestampCacheKey {
    pub fn new(region: impl Into<String>) -> Self {
        TimestampCacheKey {
            region: region.into(),
        }
    }
}

impl CacheKey for TimestampCacheKey {
    fn cache_id(&self) -> String {
        self.region.clone()
    }
}

impl fmt::Display for TimestampCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timestamp:{}", self.region)
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Type-tagged, length-prefixed digest of an identifier.
///
/// Two identifiers share a digest only if they are equal, so `Int(42)` and
/// `Text("42")` never land in the same backend slot.
fn identifier_digest(identifier: &Identifier) -> String {
    let mut hasher = Sha256::new();
    hasher.update((identifier.len() as u64).to_le_bytes());
    for (field, value) in identifier.iter() {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
        match value {
            Value::Null => hasher.update([0u8]),
            Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
            Value::Int(i) => {
                hasher.update([2u8]);
                hasher.update(i.to_le_bytes());
            }
            Value::Float(x) => {
                hasher.update([3u8]);
                hasher.update(x.to_bits().to_le_bytes());
            }
            Value::Text(s) => {
                hasher.update([4u8]);
                hasher.update((s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
            Value::Bytes(b) => {
                hasher.update([5u8]);
                hasher.update((b.len() as u64).to_le_bytes());
                hasher.update(b);
            }
        }
    }
    hex::encode(hasher.finalize())
}

fn validate_identifier(class: &str, identifier: &Identifier) -> Result<()> {
    if identifier.is_empty() {
        return Err(Error::MalformedKey(format!(
            "identifier for {} must not be empty",
            class
        )));
    }
    if let Some((field, _)) = identifier.iter().find(|(_, v)| v.is_null()) {
        return Err(Error::MalformedKey(format!(
            "identifier field {}.{} is NULL",
            class, field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_is_structural() {
        let a = EntityCacheKey::new("Order", Identifier::single("id", 42)).unwrap();
        let b = EntityCacheKey::new("Order", Identifier::single("id", 42)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cache_id(), b.cache_id());
        assert!(a.cache_id().starts_with("Order_"));
        assert_eq!(a.to_string(), "Order#id=42");
    }

    #[test]
    fn test_cache_id_distinguishes_typed_and_composite_identifiers() {
        let int = EntityCacheKey::new("Tag", Identifier::single("id", 42)).unwrap();
        let text = EntityCacheKey::new("Tag", Identifier::single("id", "42")).unwrap();
        assert_ne!(int, text);
        assert_eq!(int.to_string(), text.to_string());
        assert_ne!(int.cache_id(), text.cache_id());

        let composite =
            EntityCacheKey::new("Tag", Identifier::single("a", "1").with("b", 2)).unwrap();
        let single = EntityCacheKey::new("Tag", Identifier::single("a", "1 b=2")).unwrap();
        assert_ne!(composite.cache_id(), single.cache_id());

        let owned_by_int = CollectionCacheKey::new("Tag", "posts", Identifier::single("id", 42)).unwrap();
        let owned_by_text =
            CollectionCacheKey::new("Tag", "posts", Identifier::single("id", "42")).unwrap();
        assert_ne!(owned_by_int.cache_id(), owned_by_text.cache_id());
    }

    #[test]
    fn test_entity_key_rejects_missing_identifier() {
        let err = EntityCacheKey::new("Order", Identifier::new()).unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));

        let err = EntityCacheKey::new("", Identifier::single("id", 1)).unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));

        let err = EntityCacheKey::new("Order", Identifier::single("id", Value::Null)).unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));
    }

    #[test]
    fn test_collection_key() {
        let key =
            CollectionCacheKey::new("Order", "lines", Identifier::single("id", 42)).unwrap();
        let owner = EntityCacheKey::new("Order", Identifier::single("id", 42)).unwrap();
        assert_eq!(key.owner_key(), owner);
        assert!(key.cache_id().starts_with("Order_"));
        assert!(key.cache_id().ends_with("__lines"));
        assert!(key.cache_id().contains(&owner.cache_id()["Order_".len()..]));

        let err = CollectionCacheKey::new("Order", "", Identifier::single("id", 42)).unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));
    }

    #[test]
    fn test_query_key_is_deterministic() {
        let a = QueryCacheKey::new(
            "SELECT o FROM Order o WHERE o.total > ?",
            vec![Value::Int(10)],
            "rsm",
            0,
            Some(20),
            None,
        )
        .unwrap();
        let b = QueryCacheKey::new(
            "SELECT o FROM Order o WHERE o.total > ?",
            vec![Value::Int(10)],
            "rsm",
            0,
            Some(20),
            None,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cache_id(), b.cache_id());
        assert_eq!(a.cache_id().len(), 64);
    }

    #[test]
    fn test_query_key_depends_on_params_and_paging() {
        let sql = "SELECT o FROM Order o WHERE o.a = ? AND o.b = ?";
        let base = QueryCacheKey::new(sql, vec![1.into(), 2.into()], "rsm", 0, None, None).unwrap();
        let swapped =
            QueryCacheKey::new(sql, vec![2.into(), 1.into()], "rsm", 0, None, None).unwrap();
        let paged =
            QueryCacheKey::new(sql, vec![1.into(), 2.into()], "rsm", 10, None, None).unwrap();
        assert_ne!(base.cache_id(), swapped.cache_id());
        assert_ne!(base.cache_id(), paged.cache_id());
    }

    #[test]
    fn test_query_key_rejects_empty_sql() {
        let err = QueryCacheKey::new("  ", vec![], "rsm", 0, None, None).unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));
    }

    #[test]
    fn test_key_builder_namespaces_by_region_and_version() {
        let key = EntityCacheKey::new("Order", Identifier::single("id", 1)).unwrap();
        assert_eq!(
            CacheKeyBuilder::build("orders", 3, &key),
            "orders[3]:Order_id=1"
        );
        assert_eq!(
            CacheKeyBuilder::namespace_version_key("orders"),
            "orders:__namespace_version"
        );
    }
}

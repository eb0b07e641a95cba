//! Database collaborators consumed by the cached persisters.

use crate::entity::Entity;
use crate::entry::QueryCacheRow;
use crate::error::{Error, Result};
use crate::key::EntityCacheKey;
use crate::query::{CachedQuery, ResultRow};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Entity persistence.
///
/// Implement this for your database layer. `find` returning `Ok(None)` means
/// the row does not exist, not an error.
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    async fn find(&self, key: &EntityCacheKey) -> Result<Option<Entity>>;

    async fn insert(&self, entity: &Entity) -> Result<()>;

    async fn update(&self, entity: &Entity) -> Result<()>;

    async fn delete(&self, key: &EntityCacheKey) -> Result<()>;
}

/// To-many association persistence.
#[allow(async_fn_in_trait)]
pub trait CollectionRepository {
    /// Members of `owner.association`, in collection order.
    async fn load_collection(&self, owner: &EntityCacheKey, association: &str)
        -> Result<Vec<Entity>>;

    async fn update_collection(
        &self,
        owner: &EntityCacheKey,
        association: &str,
        members: &[EntityCacheKey],
    ) -> Result<()>;

    async fn delete_collection(&self, owner: &EntityCacheKey, association: &str) -> Result<()>;
}

/// Runs queries against the database.
#[allow(async_fn_in_trait)]
pub trait QueryExecutor {
    async fn execute(&self, query: &CachedQuery) -> Result<Vec<ResultRow>>;
}

#[derive(Default)]
struct RepositoryState {
    entities: DashMap<EntityCacheKey, Entity>,
    collections: DashMap<(EntityCacheKey, String), Vec<EntityCacheKey>>,
    queries: DashMap<String, Vec<QueryCacheRow>>,
    finds: AtomicUsize,
    collection_loads: AtomicUsize,
    executions: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

/// In-memory database double implementing all three repository traits.
///
/// Clones share state, so one instance can back several persisters. Query
/// results are registered per SQL text as rows of entity keys and scalars;
/// entity rows are resolved against the current entity table on execution.
///
/// # Example
///
/// ```
/// use orm_cache::entity::Entity;
/// use orm_cache::repository::{EntityRepository, InMemoryRepository};
/// use orm_cache::value::Identifier;
///
/// # async fn example() -> orm_cache::Result<()> {
/// let repo = InMemoryRepository::new();
/// let order = Entity::new("Order", Identifier::single("id", 42)).with_field("total", 100);
/// repo.insert(&order).await?;
///
/// assert!(repo.find(&order.cache_key()?).await?.is_some());
/// assert_eq!(repo.find_count(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RepositoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row without counting it as a write.
    pub fn seed(&self, entity: Entity) -> Result<()> {
        self.state.entities.insert(entity.cache_key()?, entity);
        Ok(())
    }

    pub fn seed_collection(
        &self,
        owner: &EntityCacheKey,
        association: &str,
        members: Vec<EntityCacheKey>,
    ) {
        self.state
            .collections
            .insert((owner.clone(), association.to_string()), members);
    }

    /// Result rows returned for `sql`.
    pub fn set_query_result(&self, sql: &str, rows: Vec<QueryCacheRow>) {
        self.state.queries.insert(sql.to_string(), rows);
    }

    /// Make every following write fail with `Error::RepositoryError`.
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &EntityCacheKey) -> Option<Entity> {
        self.state.entities.get(key).map(|e| e.value().clone())
    }

    pub fn find_count(&self) -> usize {
        self.state.finds.load(Ordering::SeqCst)
    }

    pub fn collection_load_count(&self) -> usize {
        self.state.collection_loads.load(Ordering::SeqCst)
    }

    pub fn execution_count(&self) -> usize {
        self.state.executions.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    fn write(&self) -> Result<()> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::RepositoryError("write rejected".to_string()));
        }
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, key: &EntityCacheKey) -> Result<Entity> {
        self.get(key)
            .ok_or_else(|| Error::RepositoryError(format!("dangling reference {}", key)))
    }
}

impl EntityRepository for InMemoryRepository {
    async fn find(&self, key: &EntityCacheKey) -> Result<Option<Entity>> {
        self.state.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(key))
    }

    async fn insert(&self, entity: &Entity) -> Result<()> {
        self.write()?;
        self.state
            .entities
            .insert(entity.cache_key()?, entity.clone());
        Ok(())
    }

    async fn update(&self, entity: &Entity) -> Result<()> {
        self.write()?;
        let key = entity.cache_key()?;
        if !self.state.entities.contains_key(&key) {
            return Err(Error::RepositoryError(format!("no row for {}", key)));
        }
        self.state.entities.insert(key, entity.clone());
        Ok(())
    }

    async fn delete(&self, key: &EntityCacheKey) -> Result<()> {
        self.write()?;
        self.state.entities.remove(key);
        Ok(())
    }
}

impl CollectionRepository for InMemoryRepository {
    async fn load_collection(
        &self,
        owner: &EntityCacheKey,
        association: &str,
    ) -> Result<Vec<Entity>> {
        self.state.collection_loads.fetch_add(1, Ordering::SeqCst);
        let members = self
            .state
            .collections
            .get(&(owner.clone(), association.to_string()))
            .map(|m| m.value().clone())
            .unwrap_or_default();
        members.iter().map(|key| self.load(key)).collect()
    }

    async fn update_collection(
        &self,
        owner: &EntityCacheKey,
        association: &str,
        members: &[EntityCacheKey],
    ) -> Result<()> {
        self.write()?;
        self.seed_collection(owner, association, members.to_vec());
        Ok(())
    }

    async fn delete_collection(&self, owner: &EntityCacheKey, association: &str) -> Result<()> {
        self.write()?;
        self.state
            .collections
            .remove(&(owner.clone(), association.to_string()));
        Ok(())
    }
}

impl QueryExecutor for InMemoryRepository {
    async fn execute(&self, query: &CachedQuery) -> Result<Vec<ResultRow>> {
        self.state.executions.fetch_add(1, Ordering::SeqCst);
        let rows = self
            .state
            .queries
            .get(&query.sql)
            .map(|r| r.value().clone())
            .unwrap_or_default();

        let end = query
            .max_results
            .map(|max| query.first_result.saturating_add(max))
            .unwrap_or(usize::MAX);
        rows.iter()
            .enumerate()
            .filter(|(i, _)| *i >= query.first_result && *i < end)
            .map(|(_, row)| match row {
                QueryCacheRow::Entity(key) => Ok(ResultRow::Entity(Arc::new(self.load(key)?))),
                QueryCacheRow::Scalar(values) => Ok(ResultRow::Scalar(values.clone())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ResultSetMapping;
    use crate::value::{Identifier, Value};

    fn order(id: i64, total: i64) -> Entity {
        Entity::new("Order", Identifier::single("id", id))
            .with_field("id", id)
            .with_field("total", total)
    }

    #[tokio::test]
    async fn test_entity_crud() {
        let repo = InMemoryRepository::new();
        let o = order(1, 10);
        let key = o.cache_key().unwrap();

        repo.insert(&o).await.unwrap();
        repo.update(&order(1, 20)).await.unwrap();
        let found = repo.find(&key).await.unwrap().unwrap();
        assert_eq!(found.field("total"), Some(&Value::Int(20)));

        repo.delete(&key).await.unwrap();
        assert!(repo.find(&key).await.unwrap().is_none());
        assert_eq!(repo.write_count(), 3);
        assert_eq!(repo.find_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let repo = InMemoryRepository::new();
        repo.fail_writes(true);
        let err = repo.insert(&order(1, 10)).await.unwrap_err();
        assert!(matches!(err, Error::RepositoryError(_)));
        assert!(repo.get(&order(1, 10).cache_key().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_query_paging() {
        let repo = InMemoryRepository::new();
        for id in 1..=5 {
            repo.seed(order(id, id * 10)).unwrap();
        }
        let rows = (1..=5)
            .map(|id| QueryCacheRow::Entity(order(id, 0).cache_key().unwrap()))
            .collect();
        repo.set_query_result("SELECT o FROM Order o", rows);

        let mut query = CachedQuery::new(
            "SELECT o FROM Order o",
            ResultSetMapping::new().entity_result("o", "Order"),
        );
        query.first_result = 1;
        query.max_results = Some(2);

        let result = repo.execute(&query).await.unwrap();
        let totals: Vec<_> = result
            .iter()
            .filter_map(|r| r.entity().and_then(|e| e.field("total")).cloned())
            .collect();
        assert_eq!(totals, vec![Value::Int(20), Value::Int(30)]);
    }
}

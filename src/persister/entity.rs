use super::{CacheAction, TransactionQueue};
use crate::backend::CacheBackend;
use crate::cache::SecondLevelCache;
use crate::entity::Entity;
use crate::entry::EntityCacheEntry;
use crate::error::{Error, Result};
use crate::hydrator::EntityHydrator;
use crate::key::EntityCacheKey;
use crate::metadata::{CacheUsage, ClassMetadata};
use crate::mode::CacheMode;
use crate::repository::EntityRepository;
use crate::strategy::RegionStrategy;
use crate::uow::{HydrationHints, UnitOfWork};
use crate::value::Identifier;
use std::sync::Arc;
use std::time::Instant;

/// Entity persister backed by the second-level cache.
///
/// Loads read through the entity region; writes go to the repository at once
/// and reach the cache when the transaction commits.
///
/// # Example
///
/// ```
/// use orm_cache::backend::InMemoryBackend;
/// use orm_cache::cache::SecondLevelCache;
/// use orm_cache::config::CacheConfiguration;
/// use orm_cache::entity::Entity;
/// use orm_cache::metadata::{CacheAnnotation, ClassMetadata, MetadataRegistry};
/// use orm_cache::mode::CacheMode;
/// use orm_cache::persister::CachedEntityPersister;
/// use orm_cache::repository::InMemoryRepository;
/// use orm_cache::uow::IdentityMap;
/// use orm_cache::value::Identifier;
///
/// # async fn example() -> orm_cache::Result<()> {
/// let metadata = MetadataRegistry::new().with(
///     ClassMetadata::new("Order").identifier(["id"]).field("total")
///         .cache(CacheAnnotation::read_write()),
/// )?;
/// let cache = SecondLevelCache::new(InMemoryBackend::new(), CacheConfiguration::default(), metadata);
/// let orders = CachedEntityPersister::new(&cache, "Order", InMemoryRepository::new())?;
///
/// orders.insert(&Entity::new("Order", Identifier::single("id", 1)).with_field("total", 10)).await?;
/// orders.after_transaction_committed().await?;
///
/// let uow = IdentityMap::new();
/// let order = orders.load_by_id(&Identifier::single("id", 1), &uow, CacheMode::Normal).await?;
/// assert!(order.is_some());
/// # Ok(())
/// # }
/// ```
pub struct CachedEntityPersister<'a, B: CacheBackend, R: EntityRepository> {
    cache: &'a SecondLevelCache<B>,
    metadata: Arc<ClassMetadata>,
    region: Option<Arc<RegionStrategy<B>>>,
    repository: R,
    queue: TransactionQueue<EntityCacheKey, EntityCacheEntry>,
}

impl<'a, B: CacheBackend, R: EntityRepository> CachedEntityPersister<'a, B, R> {
    /// # Errors
    /// `Error::ConfigError` for an unknown class.
    pub fn new(cache: &'a SecondLevelCache<B>, class: &str, repository: R) -> Result<Self> {
        let metadata = cache.metadata().require(class)?.clone();
        let region = cache.entity_region(class)?;
        Ok(CachedEntityPersister {
            cache,
            metadata,
            region,
            repository,
            queue: TransactionQueue::default(),
        })
    }

    pub fn metadata(&self) -> &ClassMetadata {
        &self.metadata
    }

    /// Strategy of the entity region; `None` when the class is not cacheable.
    pub fn region(&self) -> Option<&RegionStrategy<B>> {
        self.region.as_deref()
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Number of cache actions waiting for the transaction outcome.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    fn key(&self, identifier: &Identifier) -> Result<EntityCacheKey> {
        EntityCacheKey::new(self.metadata.root_name.clone(), identifier.clone())
    }

    fn class_metadata(&self, class: &str) -> Arc<ClassMetadata> {
        self.cache
            .metadata()
            .get(class)
            .cloned()
            .unwrap_or_else(|| self.metadata.clone())
    }

    fn build_entry(&self, key: &EntityCacheKey, entity: &Entity) -> Result<EntityCacheEntry> {
        EntityHydrator::new(self.cache).build_cache_entry(
            &self.class_metadata(entity.class()),
            key,
            entity,
        )
    }

    /// Load an entity, from cache when `mode` reads and from the repository otherwise.
    ///
    /// # Errors
    /// Backend, codec and repository errors propagate. `Error::InvalidatedEntry`
    /// when a read-only region holds a different snapshot than the database.
    pub async fn load_by_id(
        &self,
        identifier: &Identifier,
        uow: &dyn UnitOfWork,
        mode: CacheMode,
    ) -> Result<Option<Arc<Entity>>> {
        let timer = Instant::now();
        let key = self.key(identifier)?;
        let hints = HydrationHints {
            cache_enabled: true,
            refresh: mode.is_refresh(),
        };

        debug!("» Load {} (mode: {})", key, mode);

        if let Some(region) = self.region.as_deref().filter(|_| mode.reads()) {
            if let Some(entry) = region.get::<_, EntityCacheEntry>(&key).await? {
                let hydrated = EntityHydrator::new(self.cache)
                    .load_cache_entry(&self.class_metadata(&entry.class), &key, &entry, uow, &hints)
                    .await?;
                if let Some(entity) = hydrated {
                    uow.hydration_complete();
                    debug!("✓ {} served from cache in {:?}", key, timer.elapsed());
                    return Ok(Some(entity));
                }
            }
        }

        let Some(loaded) = self.repository.find(&key).await? else {
            debug!("✗ {} not found in repository", key);
            return Ok(None);
        };
        let entity = uow.create_entity(&key, loaded, &hints);
        uow.hydration_complete();

        if let Some(region) = self.region.as_deref().filter(|_| mode.writes()) {
            let entry = self.build_entry(&key, &entity)?;
            if mode.is_refresh() {
                region.region().evict(&key).await?;
            }
            region.put(&key, &entry).await?;
        }

        info!("✓ {} loaded from repository in {:?}", key, timer.elapsed());
        Ok(Some(entity))
    }

    /// Insert `entity`; its cache entry is written on commit.
    pub async fn insert(&self, entity: &Entity) -> Result<()> {
        self.repository.insert(entity).await?;

        if self.region.is_some() {
            let key = self.key(entity.identifier())?;
            let entry = self.build_entry(&key, entity)?;
            self.queue.push(CacheAction::Put {
                key,
                entry,
                lock: None,
            });
        }
        Ok(())
    }

    /// Update `entity`. Read-write regions lock the key before the database write.
    ///
    /// # Errors
    /// `Error::ReadOnlyEntity` when the class is cached read-only; the
    /// repository is not touched.
    pub async fn update(&self, entity: &Entity) -> Result<()> {
        let Some(region) = self.region.as_deref() else {
            return self.repository.update(entity).await;
        };

        let key = self.key(entity.identifier())?;
        if region.usage() == CacheUsage::ReadOnly {
            return Err(Error::ReadOnlyEntity(format!(
                "cannot update read-only entity {}",
                key
            )));
        }

        let entry = self.build_entry(&key, entity)?;
        let lock = region.lock(&key).await?;
        if let Err(e) = self.repository.update(entity).await {
            region.rollback(&key, lock.as_ref()).await?;
            return Err(e);
        }

        self.queue.push(CacheAction::Put { key, entry, lock });
        Ok(())
    }

    /// Delete the entity identified by `identifier`; it leaves the cache on commit.
    pub async fn delete(&self, identifier: &Identifier) -> Result<()> {
        let key = self.key(identifier)?;
        let Some(region) = self.region.as_deref() else {
            return self.repository.delete(&key).await;
        };

        let lock = region.lock(&key).await?;
        if let Err(e) = self.repository.delete(&key).await {
            region.rollback(&key, lock.as_ref()).await?;
            return Err(e);
        }

        self.queue.push(CacheAction::Remove { key, lock });
        Ok(())
    }

    /// Apply the queued cache actions.
    pub async fn after_transaction_committed(&self) -> Result<()> {
        match self.region.as_deref() {
            Some(region) => self.queue.commit(region).await,
            None => {
                self.queue.discard();
                Ok(())
            }
        }
    }

    /// Release queued locks without touching cached data.
    pub async fn after_transaction_rolled_back(&self) -> Result<()> {
        match self.region.as_deref() {
            Some(region) => self.queue.rollback(region).await,
            None => {
                self.queue.discard();
                Ok(())
            }
        }
    }
}

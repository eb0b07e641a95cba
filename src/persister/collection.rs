use super::{CacheAction, TransactionQueue};
use crate::backend::CacheBackend;
use crate::cache::SecondLevelCache;
use crate::entity::{Entity, PersistentCollection};
use crate::entry::{CollectionCacheEntry, EntityCacheEntry};
use crate::error::{Error, Result};
use crate::hydrator::{CollectionHydrator, EntityHydrator};
use crate::key::{CollectionCacheKey, EntityCacheKey};
use crate::metadata::{AssociationMetadata, CacheUsage, ClassMetadata};
use crate::mode::CacheMode;
use crate::repository::CollectionRepository;
use crate::strategy::RegionStrategy;
use crate::uow::{HydrationHints, UnitOfWork};
use std::sync::Arc;
use std::time::Instant;

/// Persister of one to-many association, backed by its collection region.
pub struct CachedCollectionPersister<'a, B: CacheBackend, R: CollectionRepository> {
    cache: &'a SecondLevelCache<B>,
    owner_metadata: Arc<ClassMetadata>,
    association: AssociationMetadata,
    target_metadata: Arc<ClassMetadata>,
    region: Option<Arc<RegionStrategy<B>>>,
    repository: R,
    queue: TransactionQueue<CollectionCacheKey, CollectionCacheEntry>,
}

impl<'a, B: CacheBackend, R: CollectionRepository> CachedCollectionPersister<'a, B, R> {
    /// # Errors
    /// `Error::ConfigError` for unknown classes, `Error::MalformedKey` when
    /// `association` is unknown or not a to-many association.
    pub fn new(
        cache: &'a SecondLevelCache<B>,
        owner_class: &str,
        association: &str,
        repository: R,
    ) -> Result<Self> {
        let owner_metadata = cache.metadata().require(owner_class)?.clone();
        let association = owner_metadata
            .get_association(association)
            .filter(|a| a.kind.is_to_many())
            .cloned()
            .ok_or_else(|| {
                Error::MalformedKey(format!(
                    "{} has no to-many association {}",
                    owner_class, association
                ))
            })?;
        let target_metadata = cache
            .metadata()
            .require(&association.target_entity)?
            .clone();
        let region = cache.collection_region(owner_class, &association.name)?;

        Ok(CachedCollectionPersister {
            cache,
            owner_metadata,
            association,
            target_metadata,
            region,
            repository,
            queue: TransactionQueue::default(),
        })
    }

    pub fn region(&self) -> Option<&RegionStrategy<B>> {
        self.region.as_deref()
    }

    pub fn association(&self) -> &AssociationMetadata {
        &self.association
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    fn key(&self, owner: &EntityCacheKey) -> Result<CollectionCacheKey> {
        CollectionCacheKey::new(
            self.owner_metadata.root_name.clone(),
            self.association.name.clone(),
            owner.identifier.clone(),
        )
    }

    fn build_entry(&self, key: &CollectionCacheKey, elements: &[Arc<Entity>]) -> Result<CollectionCacheEntry> {
        CollectionHydrator::new(self.cache).build_cache_entry(&self.target_metadata, key, elements)
    }

    /// Populate `collection`, from cache when `mode` reads and possible.
    ///
    /// On a database load, members are also written to the target entity
    /// region so that the next collection hit can hydrate them.
    pub async fn load(
        &self,
        collection: &mut PersistentCollection,
        uow: &dyn UnitOfWork,
        mode: CacheMode,
    ) -> Result<Vec<Arc<Entity>>> {
        let timer = Instant::now();
        let key = self.key(collection.owner())?;
        let hints = HydrationHints {
            cache_enabled: true,
            refresh: mode.is_refresh(),
        };

        if let Some(region) = self.region.as_deref().filter(|_| mode.reads()) {
            if let Some(entry) = region.get::<_, CollectionCacheEntry>(&key).await? {
                let hydrated = CollectionHydrator::new(self.cache)
                    .load_cache_entry(&self.owner_metadata, &key, &entry, collection, uow, &hints)
                    .await?;
                if let Some(elements) = hydrated {
                    debug!("✓ Collection {} served from cache in {:?}", key, timer.elapsed());
                    return Ok(elements);
                }
            }
        }

        let loaded = self
            .repository
            .load_collection(&key.owner_key(), &self.association.name)
            .await?;
        let mut elements = Vec::with_capacity(loaded.len());
        for entity in loaded {
            let member_key =
                EntityCacheKey::new(self.target_metadata.root_name.clone(), entity.identifier().clone())?;
            elements.push(uow.create_entity(&member_key, entity, &hints));
        }
        uow.hydration_complete();
        collection.hydrate_all(elements.clone());

        if let Some(region) = self.region.as_deref().filter(|_| mode.writes()) {
            self.cache_members(&elements, mode).await?;
            let entry = self.build_entry(&key, &elements)?;
            if mode.is_refresh() {
                region.region().evict(&key).await?;
            }
            region.put(&key, &entry).await?;
        }

        info!(
            "✓ Collection {} loaded from repository ({} members) in {:?}",
            key,
            elements.len(),
            timer.elapsed()
        );
        Ok(elements)
    }

    async fn cache_members(&self, elements: &[Arc<Entity>], mode: CacheMode) -> Result<()> {
        let Some(target_region) = self.cache.entity_region(&self.target_metadata.name)? else {
            return Ok(());
        };
        let metadata = self.cache.metadata();
        let hydrator = EntityHydrator::new(self.cache);

        for element in elements {
            let member_key =
                EntityCacheKey::new(self.target_metadata.root_name.clone(), element.identifier().clone())?;
            let member_metadata = metadata.get(element.class()).unwrap_or(&self.target_metadata);
            let entry: EntityCacheEntry =
                hydrator.build_cache_entry(member_metadata, &member_key, element)?;
            if mode.is_refresh() {
                target_region.region().evict(&member_key).await?;
            }
            target_region.put(&member_key, &entry).await?;
        }
        Ok(())
    }

    /// Persist the new content of `collection`; the cache follows on commit.
    ///
    /// # Errors
    /// `Error::ReadOnlyEntity` when the collection region is read-only.
    pub async fn update(&self, collection: &PersistentCollection) -> Result<()> {
        let key = self.key(collection.owner())?;
        let members = collection
            .elements()
            .iter()
            .map(|e| EntityCacheKey::new(self.target_metadata.root_name.clone(), e.identifier().clone()))
            .collect::<Result<Vec<_>>>()?;

        let Some(region) = self.region.as_deref() else {
            return self
                .repository
                .update_collection(&key.owner_key(), &key.association, &members)
                .await;
        };
        if region.usage() == CacheUsage::ReadOnly {
            return Err(Error::ReadOnlyEntity(format!(
                "cannot update read-only collection {}",
                key
            )));
        }

        let entry = CollectionCacheEntry::new(members);
        let lock = region.lock(&key).await?;
        if let Err(e) = self
            .repository
            .update_collection(&key.owner_key(), &key.association, &entry.members)
            .await
        {
            region.rollback(&key, lock.as_ref()).await?;
            return Err(e);
        }

        self.queue.push(CacheAction::Put { key, entry, lock });
        Ok(())
    }

    /// Delete the collection owned by `owner`; it leaves the cache on commit.
    pub async fn delete(&self, owner: &EntityCacheKey) -> Result<()> {
        let key = self.key(owner)?;
        let Some(region) = self.region.as_deref() else {
            return self
                .repository
                .delete_collection(&key.owner_key(), &key.association)
                .await;
        };

        let lock = region.lock(&key).await?;
        if let Err(e) = self
            .repository
            .delete_collection(&key.owner_key(), &key.association)
            .await
        {
            region.rollback(&key, lock.as_ref()).await?;
            return Err(e);
        }

        self.queue.push(CacheAction::Remove { key, lock });
        Ok(())
    }

    pub async fn after_transaction_committed(&self) -> Result<()> {
        match self.region.as_deref() {
            Some(region) => self.queue.commit(region).await,
            None => {
                self.queue.discard();
                Ok(())
            }
        }
    }

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

use super::{EntityHydrator, HydrationBatch};
use crate::backend::CacheBackend;
use crate::cache::SecondLevelCache;
use crate::entity::{Entity, PersistentCollection};
use crate::entry::{CollectionCacheEntry, EntityCacheEntry};
use crate::error::{Error, Result};
use crate::key::{CollectionCacheKey, EntityCacheKey};
use crate::metadata::ClassMetadata;
use crate::uow::{HydrationHints, UnitOfWork};
use std::sync::Arc;

/// Converts collections to [`CollectionCacheEntry`] member lists and back.
pub struct CollectionHydrator<'a, B: CacheBackend> {
    cache: &'a SecondLevelCache<B>,
}

impl<'a, B: CacheBackend> CollectionHydrator<'a, B> {
    pub fn new(cache: &'a SecondLevelCache<B>) -> Self {
        CollectionHydrator { cache }
    }

    /// Member keys of `elements`, in iteration order, under the target root class.
    pub fn build_cache_entry(
        &self,
        target_metadata: &ClassMetadata,
        key: &CollectionCacheKey,
        elements: &[Arc<Entity>],
    ) -> Result<CollectionCacheEntry> {
        let members = elements
            .iter()
            .map(|e| EntityCacheKey::new(target_metadata.root_name.clone(), e.identifier().clone()))
            .collect::<Result<Vec<_>>>()?;
        debug!("Built collection entry {} with {} members", key, members.len());
        Ok(CollectionCacheEntry::new(members))
    }

    /// Rebuild the collection stored in `entry` into `collection`.
    ///
    /// All members come from one multi-get on the target entity region. If
    /// any member is missing the whole collection is a miss (`Ok(None)`),
    /// `collection` is left untouched and members hydrated so far are handed
    /// back through `hydration_aborted`.
    pub async fn load_cache_entry(
        &self,
        owner_metadata: &ClassMetadata,
        key: &CollectionCacheKey,
        entry: &CollectionCacheEntry,
        collection: &mut PersistentCollection,
        uow: &dyn UnitOfWork,
        hints: &HydrationHints,
    ) -> Result<Option<Vec<Arc<Entity>>>> {
        let association = owner_metadata.get_association(&key.association).ok_or_else(|| {
            Error::MalformedKey(format!(
                "{} has no association {}",
                owner_metadata.name, key.association
            ))
        })?;
        let Some(target_region) = self.cache.entity_region(&association.target_entity)? else {
            debug!("✗ Target {} of {} is not cacheable", association.target_entity, key);
            return Ok(None);
        };

        let Some(entries) = target_region
            .get_multiple::<_, EntityCacheEntry>(&entry.members)
            .await?
        else {
            debug!("✗ Collection {} has uncached members", key);
            return Ok(None);
        };

        let target_metadata = self.cache.metadata().require(&association.target_entity)?;
        let elements = match self
            .load_members(target_metadata, key, entry, &entries, uow, hints)
            .await
        {
            Ok(Some(elements)) => elements,
            other => {
                uow.hydration_aborted();
                return other;
            }
        };

        for (index, entity) in elements.iter().enumerate() {
            collection.hydrate_set(index, entity.clone());
        }
        collection.mark_initialized();
        uow.hydration_complete();

        debug!("✓ Hydrated collection {} ({} members)", key, elements.len());
        Ok(Some(elements))
    }

    async fn load_members(
        &self,
        target_metadata: &ClassMetadata,
        key: &CollectionCacheKey,
        entry: &CollectionCacheEntry,
        entries: &[EntityCacheEntry],
        uow: &dyn UnitOfWork,
        hints: &HydrationHints,
    ) -> Result<Option<Vec<Arc<Entity>>>> {
        let metadata = self.cache.metadata();
        let hydrator = EntityHydrator::new(self.cache);
        let batch = HydrationBatch::default();
        let mut elements = Vec::with_capacity(entries.len());

        for (member, member_entry) in entry.members.iter().zip(entries) {
            let member_metadata = metadata
                .get(&member_entry.class)
                .map(|m| &**m)
                .unwrap_or(target_metadata);
            match hydrator
                .load_in_batch(&batch, member_metadata, member, member_entry, uow, hints)
                .await?
            {
                Some(entity) => elements.push(entity),
                None => {
                    debug!("✗ Member {} of {} could not be hydrated", member, key);
                    return Ok(None);
                }
            }
        }
        Ok(Some(elements))
    }
}

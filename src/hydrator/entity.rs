use super::HydrationBatch;
use crate::backend::CacheBackend;
use crate::cache::SecondLevelCache;
use crate::entity::{Entity, EntityReference};
use crate::entry::{AssociationResolver, EntityCacheEntry, FieldValue};
use crate::error::{Error, Result};
use crate::key::EntityCacheKey;
use crate::metadata::{AssociationKind, ClassMetadata, FetchMode};
use crate::uow::{HydrationHints, UnitOfWork};
use crate::value::Value;
use futures::future::{FutureExt, LocalBoxFuture};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Converts entities to [`EntityCacheEntry`] snapshots and back.
pub struct EntityHydrator<'a, B: CacheBackend> {
    cache: &'a SecondLevelCache<B>,
}

impl<'a, B: CacheBackend> EntityHydrator<'a, B> {
    pub fn new(cache: &'a SecondLevelCache<B>) -> Self {
        EntityHydrator { cache }
    }

    /// Snapshot `entity` for storage under `key`.
    ///
    /// Scalar fields are copied (missing ones as `Null`). Owning-side to-one
    /// associations are stored as the target's key; inverse one-to-one and
    /// to-many associations are not stored.
    ///
    /// # Errors
    /// `Error::MalformedKey` when the entity lacks an identifier field or its
    /// identifier differs from the key's.
    pub fn build_cache_entry(
        &self,
        metadata: &ClassMetadata,
        key: &EntityCacheKey,
        entity: &Entity,
    ) -> Result<EntityCacheEntry> {
        if let Some(missing) = metadata
            .identifier
            .iter()
            .find(|field| !entity.identifier().contains(field))
        {
            return Err(Error::MalformedKey(format!(
                "{} has no value for identifier field {}",
                key, missing
            )));
        }
        if entity.identifier() != &key.identifier {
            return Err(Error::MalformedKey(format!(
                "entity identifier {} does not match key {}",
                entity.identifier(),
                key
            )));
        }

        let mut data = BTreeMap::new();
        for field in &metadata.fields {
            let value = entity
                .field(field)
                .or_else(|| entity.identifier().get(field))
                .cloned()
                .unwrap_or(Value::Null);
            data.insert(field.clone(), FieldValue::Scalar(value));
        }

        for association in &metadata.associations {
            let stored = match association.kind {
                AssociationKind::ManyToOne => true,
                AssociationKind::OneToOne => association.is_owning_side(),
                AssociationKind::OneToMany | AssociationKind::ManyToMany => false,
            };
            if !stored {
                continue;
            }

            let value = match entity.reference(&association.name).flatten() {
                Some(reference) => FieldValue::Association(EntityCacheKey::new(
                    self.cache.metadata().root_of(&association.target_entity),
                    reference.key()?.identifier,
                )?),
                None => FieldValue::NullAssociation,
            };
            data.insert(association.name.clone(), value);
        }

        Ok(EntityCacheEntry::new(entity.class(), data))
    }

    /// Rebuild the entity stored in `entry`.
    ///
    /// Returns `Ok(None)` when an eagerly fetched, cacheable association is
    /// missing from its region; the whole entity is then a miss and whatever
    /// was already created is handed back through `hydration_aborted`.
    pub async fn load_cache_entry(
        &self,
        metadata: &ClassMetadata,
        key: &EntityCacheKey,
        entry: &EntityCacheEntry,
        uow: &dyn UnitOfWork,
        hints: &HydrationHints,
    ) -> Result<Option<Arc<Entity>>> {
        let batch = HydrationBatch::default();
        let loaded = self
            .load_in_batch(&batch, metadata, key, entry, uow, hints)
            .await;
        if !matches!(loaded, Ok(Some(_))) {
            uow.hydration_aborted();
        }
        loaded
    }

    pub(crate) fn load_in_batch<'b>(
        &'b self,
        batch: &'b HydrationBatch,
        metadata: &'b ClassMetadata,
        key: &'b EntityCacheKey,
        entry: &'b EntityCacheEntry,
        uow: &'b dyn UnitOfWork,
        hints: &'b HydrationHints,
    ) -> LocalBoxFuture<'b, Result<Option<Arc<Entity>>>> {
        async move {
            if let Some(entity) = batch.get(key) {
                return Ok(Some(entity));
            }

            batch.begin(key);
            let resolver = BatchResolver {
                hydrator: self,
                batch,
                metadata,
                uow,
                hints,
            };
            let resolved = match entry.resolve_association_entries(&resolver).await {
                Ok(Some(resolved)) => resolved,
                Ok(None) => {
                    batch.finish(key, None);
                    return Ok(None);
                }
                Err(e) => {
                    batch.finish(key, None);
                    return Err(e);
                }
            };

            let mut entity = Entity::new(entry.class.clone(), key.identifier.clone())
                .in_hierarchy(key.entity_class.clone());
            for (field, value) in resolved.fields {
                entity.set_field(field, value);
            }
            for (name, reference) in resolved.references {
                entity = entity.with_reference(name, reference);
            }

            let managed = uow.create_entity(key, entity, hints);
            batch.finish(key, Some(managed.clone()));
            debug!("✓ Hydrated {} from cache", key);
            Ok(Some(managed))
        }
        .boxed_local()
    }
}

/// Resolves the association references of one entry inside a batch.
struct BatchResolver<'h, 'a, B: CacheBackend> {
    hydrator: &'h EntityHydrator<'a, B>,
    batch: &'h HydrationBatch,
    metadata: &'h ClassMetadata,
    uow: &'h dyn UnitOfWork,
    hints: &'h HydrationHints,
}

impl<'h, 'a, B: CacheBackend> AssociationResolver for BatchResolver<'h, 'a, B> {
    fn resolve<'r>(
        &'r self,
        field: &'r str,
        key: &'r EntityCacheKey,
    ) -> LocalBoxFuture<'r, Result<Option<EntityReference>>> {
        async move {
            if let Some(entity) = self.batch.get(key) {
                return Ok(Some(EntityReference::Loaded(entity)));
            }
            // cycle
            if self.batch.is_in_progress(key) {
                return Ok(Some(EntityReference::Proxy(key.clone())));
            }
            if let Some(managed) = self.uow.try_get_by_id(key) {
                return Ok(Some(EntityReference::Loaded(managed)));
            }

            let proxy = Ok(Some(EntityReference::Proxy(key.clone())));
            let Some(association) = self.metadata.get_association(field) else {
                return proxy;
            };
            if association.fetch != FetchMode::Eager || !self.hints.cache_enabled {
                return proxy;
            }

            let cache = self.hydrator.cache;
            let Some(region) = cache.entity_region(&association.target_entity)? else {
                return proxy;
            };
            let Some(target) = region.get::<_, EntityCacheEntry>(key).await? else {
                debug!("✗ Eager association {} -> {} not cached", field, key);
                return Ok(None);
            };

            let target_metadata = match cache.metadata().get(&target.class) {
                Some(metadata) => metadata.clone(),
                None => cache.metadata().require(&association.target_entity)?.clone(),
            };
            let loaded = self
                .hydrator
                .load_in_batch(self.batch, &target_metadata, key, &target, self.uow, self.hints)
                .await?;
            Ok(loaded.map(EntityReference::Loaded))
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::CacheConfiguration;
    use crate::metadata::{AssociationMetadata, CacheAnnotation, MetadataRegistry};
    use crate::uow::IdentityMap;
    use crate::value::Identifier;

    fn metadata(customer_fetch: FetchMode) -> MetadataRegistry {
        MetadataRegistry::new()
            .with(
                ClassMetadata::new("Order")
                    .identifier(["id"])
                    .field("total")
                    .association(
                        AssociationMetadata::many_to_one("customer", "Customer")
                            .fetch(customer_fetch),
                    )
                    .association(AssociationMetadata::one_to_many("lines", "Line").mapped_by("order"))
                    .association(AssociationMetadata::one_to_one("invoice", "Invoice").mapped_by("order"))
                    .cache(CacheAnnotation::nonstrict_read_write()),
            )
            .and_then(|r| {
                r.with(
                    ClassMetadata::new("Customer")
                        .identifier(["id"])
                        .field("name")
                        .association(
                            AssociationMetadata::many_to_one("favorite", "Order")
                                .fetch(FetchMode::Eager),
                        )
                        .cache(CacheAnnotation::nonstrict_read_write()),
                )
            })
            .and_then(|r| r.with(ClassMetadata::new("Line").identifier(["id"])))
            .and_then(|r| r.with(ClassMetadata::new("Invoice").identifier(["id"])))
            .unwrap()
    }

    fn cache(customer_fetch: FetchMode) -> SecondLevelCache<InMemoryBackend> {
        SecondLevelCache::new(
            InMemoryBackend::new(),
            CacheConfiguration::default(),
            metadata(customer_fetch),
        )
    }

    fn key(class: &str, id: i64) -> EntityCacheKey {
        EntityCacheKey::new(class, Identifier::single("id", id)).unwrap()
    }

    fn order_42() -> Entity {
        Entity::new("Order", Identifier::single("id", 42))
            .with_field("id", 42)
            .with_field("total", 100)
            .with_reference("customer", Some(EntityReference::Proxy(key("Customer", 7))))
    }

    fn customer_7(favorite: Option<EntityReference>) -> Entity {
        Entity::new("Customer", Identifier::single("id", 7))
            .with_field("id", 7)
            .with_field("name", "Ada")
            .with_reference("favorite", favorite)
    }

    async fn store(cache: &SecondLevelCache<InMemoryBackend>, entity: &Entity) {
        let hydrator = EntityHydrator::new(cache);
        let metadata = cache.metadata().require(entity.class()).unwrap().clone();
        let key = entity.cache_key().unwrap();
        let entry = hydrator.build_cache_entry(&metadata, &key, entity).unwrap();
        cache
            .entity_region(entity.class())
            .unwrap()
            .unwrap()
            .put(&key, &entry)
            .await
            .unwrap();
    }

    #[test]
    fn test_build_stores_owning_to_one_as_key() {
        let cache = cache(FetchMode::Lazy);
        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();

        let entry = hydrator
            .build_cache_entry(&metadata, &key("Order", 42), &order_42())
            .unwrap();

        assert_eq!(entry.scalar("total"), Some(&Value::Int(100)));
        assert_eq!(entry.scalar("id"), Some(&Value::Int(42)));
        assert_eq!(entry.association("customer"), Some(&key("Customer", 7)));
        assert!(!entry.data.contains_key("lines"));
        assert!(!entry.data.contains_key("invoice"));
    }

    #[test]
    fn test_build_null_and_missing_fields() {
        let cache = cache(FetchMode::Lazy);
        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();
        let order = Entity::new("Order", Identifier::single("id", 1));

        let entry = hydrator
            .build_cache_entry(&metadata, &key("Order", 1), &order)
            .unwrap();
        assert_eq!(entry.scalar("total"), Some(&Value::Null));
        assert_eq!(entry.scalar("id"), Some(&Value::Int(1)));
        assert_eq!(entry.data.get("customer"), Some(&FieldValue::NullAssociation));
    }

    #[test]
    fn test_build_rejects_foreign_identifier() {
        let cache = cache(FetchMode::Lazy);
        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();

        let err = hydrator
            .build_cache_entry(&metadata, &key("Order", 43), &order_42())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));

        let no_id = Entity::new("Order", Identifier::single("code", "A"));
        let err = hydrator
            .build_cache_entry(
                &metadata,
                &EntityCacheKey::new("Order", Identifier::single("code", "A")).unwrap(),
                &no_id,
            )
            .unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));
    }

    #[tokio::test]
    async fn test_lazy_association_loads_as_proxy() {
        let cache = cache(FetchMode::Lazy);
        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();
        let entry = hydrator
            .build_cache_entry(&metadata, &key("Order", 42), &order_42())
            .unwrap();

        let uow = IdentityMap::new();
        let order = hydrator
            .load_cache_entry(&metadata, &key("Order", 42), &entry, &uow, &HydrationHints::cached())
            .await
            .unwrap()
            .expect("hydrated");

        assert_eq!(order.field("total"), Some(&Value::Int(100)));
        let customer = order.reference("customer").flatten().expect("customer");
        assert!(!customer.is_initialized());
        assert_eq!(customer.key().unwrap(), key("Customer", 7));
        assert!(uow.contains(&key("Order", 42)));
    }

    #[tokio::test]
    async fn test_eager_association_pulls_from_region() {
        let cache = cache(FetchMode::Eager);
        store(&cache, &customer_7(None)).await;
        store(&cache, &order_42()).await;

        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();
        let entry: EntityCacheEntry = cache
            .entity_region("Order")
            .unwrap()
            .unwrap()
            .get(&key("Order", 42))
            .await
            .unwrap()
            .unwrap();

        let uow = IdentityMap::new();
        let order = hydrator
            .load_cache_entry(&metadata, &key("Order", 42), &entry, &uow, &HydrationHints::cached())
            .await
            .unwrap()
            .expect("hydrated");

        let customer = order.reference("customer").flatten().expect("customer");
        let customer = customer.entity().expect("loaded");
        assert_eq!(customer.field("name"), Some(&Value::from("Ada")));
        assert_eq!(uow.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_eager_target_is_a_miss() {
        let cache = cache(FetchMode::Eager);
        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();
        let entry = hydrator
            .build_cache_entry(&metadata, &key("Order", 42), &order_42())
            .unwrap();

        let uow = IdentityMap::new();
        let order = hydrator
            .load_cache_entry(&metadata, &key("Order", 42), &entry, &uow, &HydrationHints::cached())
            .await
            .unwrap();
        assert!(order.is_none());
        assert!(uow.is_empty());

        // With the cache disabled for associations, the target becomes a proxy.
        let order = hydrator
            .load_cache_entry(&metadata, &key("Order", 42), &entry, &uow, &HydrationHints::uncached())
            .await
            .unwrap()
            .expect("hydrated");
        assert!(!order.reference("customer").flatten().unwrap().is_initialized());
    }

    #[tokio::test]
    async fn test_cycle_resolves_to_proxy() {
        let cache = cache(FetchMode::Eager);
        store(
            &cache,
            &customer_7(Some(EntityReference::Proxy(key("Order", 42)))),
        )
        .await;
        store(&cache, &order_42()).await;

        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();
        let entry: EntityCacheEntry = cache
            .entity_region("Order")
            .unwrap()
            .unwrap()
            .get(&key("Order", 42))
            .await
            .unwrap()
            .unwrap();

        let uow = IdentityMap::new();
        let batch = HydrationBatch::default();
        let order = hydrator
            .load_in_batch(&batch, &metadata, &key("Order", 42), &entry, &uow, &HydrationHints::cached())
            .await
            .unwrap()
            .expect("hydrated");

        let customer = order
            .reference("customer")
            .flatten()
            .and_then(EntityReference::entity)
            .expect("loaded customer");
        let favorite = customer.reference("favorite").flatten().expect("favorite");
        assert!(!favorite.is_initialized());
        assert_eq!(favorite.key().unwrap(), key("Order", 42));
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_managed_instance_is_reused() {
        let cache = cache(FetchMode::Eager);
        let hydrator = EntityHydrator::new(&cache);
        let metadata = cache.metadata().require("Order").unwrap().clone();
        let entry = hydrator
            .build_cache_entry(&metadata, &key("Order", 42), &order_42())
            .unwrap();

        let uow = IdentityMap::new();
        let managed = uow.create_entity(&key("Customer", 7), customer_7(None), &HydrationHints::cached());

        let order = hydrator
            .load_cache_entry(&metadata, &key("Order", 42), &entry, &uow, &HydrationHints::cached())
            .await
            .unwrap()
            .expect("hydrated");
        let customer = order.reference("customer").flatten().and_then(EntityReference::entity).unwrap();
        assert!(Arc::ptr_eq(customer, &managed));
    }

    #[tokio::test]
    async fn test_partial_eager_graph_is_discarded() {
        let metadata = MetadataRegistry::new()
            .with(
                ClassMetadata::new("Shipment")
                    .identifier(["id"])
                    .association(
                        AssociationMetadata::many_to_one("billing", "Address").fetch(FetchMode::Eager),
                    )
                    .association(
                        AssociationMetadata::many_to_one("shipping", "Address").fetch(FetchMode::Eager),
                    )
                    .cache(CacheAnnotation::nonstrict_read_write()),
            )
            .and_then(|r| {
                r.with(
                    ClassMetadata::new("Address")
                        .identifier(["id"])
                        .field("city")
                        .cache(CacheAnnotation::nonstrict_read_write()),
                )
            })
            .unwrap();
        let cache =
            SecondLevelCache::new(InMemoryBackend::new(), CacheConfiguration::default(), metadata);
        store(
            &cache,
            &Entity::new("Address", Identifier::single("id", 1))
                .with_field("id", 1)
                .with_field("city", "Lyon"),
        )
        .await;

        let shipment = Entity::new("Shipment", Identifier::single("id", 5))
            .with_field("id", 5)
            .with_reference("billing", Some(EntityReference::Proxy(key("Address", 1))))
            .with_reference("shipping", Some(EntityReference::Proxy(key("Address", 2))));
        let hydrator = EntityHydrator::new(&cache);
        let shipment_metadata = cache.metadata().require("Shipment").unwrap().clone();
        let entry = hydrator
            .build_cache_entry(&shipment_metadata, &key("Shipment", 5), &shipment)
            .unwrap();

        let uow = IdentityMap::new();
        let announced = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = announced.clone();
        uow.on_post_load(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let loaded = hydrator
            .load_cache_entry(&shipment_metadata, &key("Shipment", 5), &entry, &uow, &HydrationHints::cached())
            .await
            .unwrap();
        assert!(loaded.is_none());
        assert!(!uow.contains(&key("Address", 1)));

        uow.hydration_complete();
        assert_eq!(announced.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}

//! The second-level cache registry: regions built from mapping metadata.

use crate::backend::CacheBackend;
use crate::config::CacheConfiguration;
use crate::error::{Error, Result};
use crate::key::{CollectionCacheKey, EntityCacheKey};
use crate::metadata::{CacheUsage, ClassMetadata, MetadataRegistry};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::query::QueryCache;
use crate::region::{DefaultRegion, TimestampRegion};
use crate::strategy::RegionStrategy;
use crate::value::Identifier;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Entry point of the second-level cache.
///
/// Owns the backend handle, configuration, metadata and the lazily built
/// region strategies. Shared by persisters through `&SecondLevelCache`.
///
/// # Example
///
/// ```
/// use orm_cache::backend::InMemoryBackend;
/// use orm_cache::cache::SecondLevelCache;
/// use orm_cache::config::CacheConfiguration;
/// use orm_cache::metadata::{CacheAnnotation, ClassMetadata, MetadataRegistry};
///
/// let metadata = MetadataRegistry::new()
///     .with(ClassMetadata::new("Country").identifier(["id"]).cache(CacheAnnotation::read_only()))
///     .unwrap();
/// let cache = SecondLevelCache::new(InMemoryBackend::new(), CacheConfiguration::default(), metadata);
///
/// let region = cache.entity_region("Country").unwrap().unwrap();
/// assert_eq!(region.name(), "country");
/// ```
pub struct SecondLevelCache<B: CacheBackend> {
    backend: B,
    config: CacheConfiguration,
    metadata: MetadataRegistry,
    metrics: Arc<dyn CacheMetrics>,
    timestamps: Arc<TimestampRegion<B>>,
    // one handle per region name, whatever kind of region asked for it
    regions: DashMap<String, Arc<RegionStrategy<B>>>,
}

impl<B: CacheBackend> SecondLevelCache<B> {
    pub fn new(backend: B, config: CacheConfiguration, metadata: MetadataRegistry) -> Self {
        let timestamps = Arc::new(TimestampRegion::new(
            config.timestamp_region.clone(),
            backend.clone(),
        ));
        SecondLevelCache {
            backend,
            config,
            metadata,
            metrics: Arc::new(NoOpMetrics),
            timestamps,
            regions: DashMap::new(),
        }
    }

    /// Set the metrics sink. Regions created afterwards report to it.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self.regions.clear();
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &CacheConfiguration {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }

    pub fn metrics(&self) -> &Arc<dyn CacheMetrics> {
        &self.metrics
    }

    pub fn timestamps(&self) -> &Arc<TimestampRegion<B>> {
        &self.timestamps
    }

    /// Metadata of the hierarchy root of `metadata`, or `metadata` itself.
    fn root_metadata<'m>(&'m self, metadata: &'m ClassMetadata) -> &'m ClassMetadata {
        self.metadata
            .get(&metadata.root_name)
            .map(|m| &**m)
            .unwrap_or(metadata)
    }

    /// Region name of an entity class: the explicit region of its root's cache
    /// mapping, otherwise the lowercased root class name.
    pub fn entity_region_name(&self, metadata: &ClassMetadata) -> String {
        let root = self.root_metadata(metadata);
        match root.cache.as_ref().and_then(|c| c.region.clone()) {
            Some(region) => region,
            None => default_region_name(&root.name),
        }
    }

    /// Region name of a to-many association of `metadata`.
    pub fn collection_region_name(&self, metadata: &ClassMetadata, association: &str) -> String {
        let explicit = metadata
            .get_association(association)
            .and_then(|a| a.cache.as_ref())
            .and_then(|c| c.region.clone());
        match explicit {
            Some(region) => region,
            None => format!("{}__{}", self.entity_region_name(metadata), association),
        }
    }

    /// Strategy of the entity region of `class`; `None` when the hierarchy is not cacheable.
    ///
    /// # Errors
    /// `Error::ConfigError` for an unknown class.
    pub fn entity_region(&self, class: &str) -> Result<Option<Arc<RegionStrategy<B>>>> {
        let metadata = self.metadata.require(class)?;
        let root = self.root_metadata(metadata);
        let Some(cache) = root.cache.as_ref() else {
            return Ok(None);
        };
        let name = self.entity_region_name(metadata);
        Ok(Some(self.strategy(&name, cache.usage)))
    }

    /// Strategy of the collection region of `class.association`; `None` when the
    /// association carries no cache mapping.
    ///
    /// # Errors
    /// `Error::ConfigError` for an unknown class, `Error::MalformedKey` for an
    /// unknown association.
    pub fn collection_region(
        &self,
        class: &str,
        association: &str,
    ) -> Result<Option<Arc<RegionStrategy<B>>>> {
        let metadata = self.metadata.require(class)?;
        let assoc = metadata.get_association(association).ok_or_else(|| {
            Error::MalformedKey(format!("{} has no association {}", class, association))
        })?;
        let Some(cache) = assoc.cache.as_ref() else {
            return Ok(None);
        };
        let name = self.collection_region_name(metadata, association);
        Ok(Some(self.strategy(&name, cache.usage)))
    }

    /// Strategy of a query region (the configured default when `name` is `None`).
    pub fn query_region(&self, name: Option<&str>) -> Arc<RegionStrategy<B>> {
        let name = name.unwrap_or(&self.config.default_query_region);
        self.strategy(name, CacheUsage::NonstrictReadWrite)
    }

    /// Query cache over the given query region.
    pub fn query_cache(&self, region: Option<&str>) -> QueryCache<'_, B> {
        QueryCache::new(self, self.query_region(region))
    }

    /// Get or create the strategy of region `name`.
    ///
    /// The first caller decides the usage; a later caller asking for another
    /// usage gets the existing strategy and a warning.
    fn strategy(&self, name: &str, usage: CacheUsage) -> Arc<RegionStrategy<B>> {
        if let Some(existing) = self.regions.get(name) {
            return self.check_usage(existing.value(), usage);
        }

        let strategy = self
            .regions
            .entry(name.to_string())
            .or_insert_with(|| {
                let lifetime = self.config.regions.lifetime(name);
                info!(
                    "✓ Region {} created (usage: {}, lifetime: {:?})",
                    name, usage, lifetime
                );
                Arc::new(RegionStrategy::new(
                    usage,
                    DefaultRegion::new(name, self.backend.clone(), lifetime),
                    self.config.regions.lock_lifetime(name),
                    self.timestamps.clone(),
                    self.metrics.clone(),
                ))
            })
            .value()
            .clone();
        self.check_usage(&strategy, usage)
    }

    fn check_usage(
        &self,
        strategy: &Arc<RegionStrategy<B>>,
        usage: CacheUsage,
    ) -> Arc<RegionStrategy<B>> {
        if strategy.usage() != usage {
            warn!(
                "Region {} is shared by mappings with different usages: keeping {}, ignoring {}",
                strategy.name(),
                strategy.usage(),
                usage
            );
        }
        strategy.clone()
    }

    fn entity_key(&self, class: &str, identifier: &Identifier) -> Result<EntityCacheKey> {
        let root = self.metadata.root_of(class);
        EntityCacheKey::new(root, identifier.clone())
    }

    fn cacheable_roots(&self) -> BTreeSet<String> {
        self.metadata
            .classes()
            .filter(|m| m.name == m.root_name && m.is_cacheable())
            .map(|m| m.name.clone())
            .collect()
    }

    pub async fn contains_entity(&self, class: &str, identifier: &Identifier) -> Result<bool> {
        match self.entity_region(class)? {
            Some(region) => region.contains(&self.entity_key(class, identifier)?).await,
            None => Ok(false),
        }
    }

    pub async fn evict_entity(&self, class: &str, identifier: &Identifier) -> Result<()> {
        if let Some(region) = self.entity_region(class)? {
            region.evict(&self.entity_key(class, identifier)?).await?;
        }
        Ok(())
    }

    pub async fn evict_entity_region(&self, class: &str) -> Result<()> {
        if let Some(region) = self.entity_region(class)? {
            region.evict_all().await?;
        }
        Ok(())
    }

    /// Evict every cacheable entity region.
    pub async fn evict_entity_regions(&self) -> Result<()> {
        for class in self.cacheable_roots() {
            self.evict_entity_region(&class).await?;
        }
        Ok(())
    }

    pub async fn contains_collection(
        &self,
        class: &str,
        association: &str,
        owner: &Identifier,
    ) -> Result<bool> {
        match self.collection_region(class, association)? {
            Some(region) => {
                let key = CollectionCacheKey::new(
                    self.metadata.root_of(class),
                    association,
                    owner.clone(),
                )?;
                region.contains(&key).await
            }
            None => Ok(false),
        }
    }

    pub async fn evict_collection(
        &self,
        class: &str,
        association: &str,
        owner: &Identifier,
    ) -> Result<()> {
        if let Some(region) = self.collection_region(class, association)? {
            let key =
                CollectionCacheKey::new(self.metadata.root_of(class), association, owner.clone())?;
            region.evict(&key).await?;
        }
        Ok(())
    }

    pub async fn evict_collection_region(&self, class: &str, association: &str) -> Result<()> {
        if let Some(region) = self.collection_region(class, association)? {
            region.evict_all().await?;
        }
        Ok(())
    }

    pub async fn evict_query_region(&self, name: Option<&str>) -> Result<()> {
        self.query_cache(name).clear().await
    }

    /// Evict the default query region and every other query region used so far.
    pub async fn evict_query_regions(&self) -> Result<()> {
        self.evict_query_region(None).await?;
        let mapped = self.mapped_region_names();
        let used: Vec<Arc<RegionStrategy<B>>> = self
            .regions
            .iter()
            .filter(|r| !mapped.contains(r.key()) && *r.key() != self.config.default_query_region)
            .map(|r| r.value().clone())
            .collect();
        for region in used {
            region.evict_all().await?;
        }
        Ok(())
    }

    /// Names of every entity and collection region declared by the metadata.
    fn mapped_region_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for class in self.metadata.classes() {
            if self.root_metadata(class).is_cacheable() {
                names.insert(self.entity_region_name(class));
            }
            for assoc in class.associations.iter().filter(|a| a.cache.is_some()) {
                names.insert(self.collection_region_name(class, &assoc.name));
            }
        }
        names
    }
}

/// Lowercased class name with namespace separators flattened.
fn default_region_name(class: &str) -> String {
    class.replace("::", "_").replace('\\', "_").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::entry::CollectionCacheEntry;
    use crate::metadata::{AssociationMetadata, CacheAnnotation};

    fn cache() -> SecondLevelCache<InMemoryBackend> {
        let metadata = MetadataRegistry::new()
            .with(
                ClassMetadata::new("App\\Entity\\Order")
                    .identifier(["id"])
                    .association(
                        AssociationMetadata::one_to_many("lines", "Line")
                            .mapped_by("order")
                            .cache(CacheAnnotation::nonstrict_read_write()),
                    )
                    .association(AssociationMetadata::many_to_one("customer", "Customer"))
                    .cache(CacheAnnotation::read_write()),
            )
            .and_then(|r| {
                r.with(
                    ClassMetadata::new("SpecialOrder")
                        .root("App\\Entity\\Order")
                        .identifier(["id"]),
                )
            })
            .and_then(|r| {
                r.with(
                    ClassMetadata::new("Customer")
                        .identifier(["id"])
                        .cache(CacheAnnotation::read_only().region("people")),
                )
            })
            .and_then(|r| r.with(ClassMetadata::new("Line").identifier(["id"])))
            .unwrap();
        SecondLevelCache::new(InMemoryBackend::new(), CacheConfiguration::default(), metadata)
    }

    #[test]
    fn test_region_naming() {
        let cache = cache();
        let order = cache.entity_region("App\\Entity\\Order").unwrap().unwrap();
        assert_eq!(order.name(), "app_entity_order");
        assert_eq!(order.usage(), CacheUsage::ReadWrite);

        let customer = cache.entity_region("Customer").unwrap().unwrap();
        assert_eq!(customer.name(), "people");

        let lines = cache
            .collection_region("App\\Entity\\Order", "lines")
            .unwrap()
            .unwrap();
        assert_eq!(lines.name(), "app_entity_order__lines");
        assert_eq!(lines.usage(), CacheUsage::NonstrictReadWrite);
    }

    #[test]
    fn test_subclass_shares_root_region() {
        let cache = cache();
        let root = cache.entity_region("App\\Entity\\Order").unwrap().unwrap();
        let sub = cache.entity_region("SpecialOrder").unwrap().unwrap();
        assert!(Arc::ptr_eq(&root, &sub));
    }

    #[test]
    fn test_non_cacheable_and_unknown() {
        let cache = cache();
        assert!(cache.entity_region("Line").unwrap().is_none());
        assert!(cache
            .collection_region("App\\Entity\\Order", "customer")
            .unwrap()
            .is_none());
        assert!(matches!(
            cache.entity_region("Nope"),
            Err(Error::ConfigError(_))
        ));
        assert!(matches!(
            cache.collection_region("App\\Entity\\Order", "nope"),
            Err(Error::MalformedKey(_))
        ));
    }

    #[tokio::test]
    async fn test_admin_eviction() {
        let cache = cache();
        let order = cache.entity_region("App\\Entity\\Order").unwrap().unwrap();
        let id = Identifier::single("id", 1);
        let key = EntityCacheKey::new("App\\Entity\\Order", id.clone()).unwrap();
        order.put(&key, &"entry".to_string()).await.unwrap();

        assert!(cache.contains_entity("SpecialOrder", &id).await.unwrap());
        cache.evict_entity("App\\Entity\\Order", &id).await.unwrap();
        assert!(!cache.contains_entity("App\\Entity\\Order", &id).await.unwrap());

        order.put(&key, &"entry".to_string()).await.unwrap();
        cache.evict_entity_regions().await.unwrap();
        assert!(!cache.contains_entity("App\\Entity\\Order", &id).await.unwrap());
        assert!(cache
            .timestamps()
            .get("app_entity_order")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_collection_eviction() {
        let cache = cache();
        let id = Identifier::single("id", 1);
        let lines = cache
            .collection_region("App\\Entity\\Order", "lines")
            .unwrap()
            .unwrap();
        let key = CollectionCacheKey::new("App\\Entity\\Order", "lines", id.clone()).unwrap();
        lines.put(&key, &CollectionCacheEntry::default()).await.unwrap();

        assert!(cache
            .contains_collection("App\\Entity\\Order", "lines", &id)
            .await
            .unwrap());
        cache
            .evict_collection_region("App\\Entity\\Order", "lines")
            .await
            .unwrap();
        assert!(!cache
            .contains_collection("App\\Entity\\Order", "lines", &id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_eviction_is_seen_by_other_caches_on_the_same_backend() {
        let first = cache();
        let backend = first.backend().clone();
        let second =
            SecondLevelCache::new(backend, CacheConfiguration::default(), first.metadata().clone());
        let id = Identifier::single("id", 1);
        let key = EntityCacheKey::new("App\\Entity\\Order", id.clone()).unwrap();

        let region = second.entity_region("App\\Entity\\Order").unwrap().unwrap();
        region.put(&key, &"entry".to_string()).await.unwrap();
        assert!(first.contains_entity("App\\Entity\\Order", &id).await.unwrap());

        first.evict_entity_region("App\\Entity\\Order").await.unwrap();
        assert!(!second.contains_entity("App\\Entity\\Order", &id).await.unwrap());
    }

    #[test]
    fn test_shared_region_keeps_first_usage() {
        let metadata = MetadataRegistry::new()
            .with(
                ClassMetadata::new("Country")
                    .identifier(["code"])
                    .cache(CacheAnnotation::read_only().region("reference")),
            )
            .and_then(|r| {
                r.with(
                    ClassMetadata::new("Currency")
                        .identifier(["code"])
                        .cache(CacheAnnotation::read_write().region("reference")),
                )
            })
            .unwrap();
        let cache =
            SecondLevelCache::new(InMemoryBackend::new(), CacheConfiguration::default(), metadata);

        let country = cache.entity_region("Country").unwrap().unwrap();
        let currency = cache.entity_region("Currency").unwrap().unwrap();
        assert!(Arc::ptr_eq(&country, &currency));
        assert_eq!(currency.usage(), CacheUsage::ReadOnly);

        let query = cache.query_region(Some("reference"));
        assert!(Arc::ptr_eq(&query, &country));
    }

    #[tokio::test]
    async fn test_evict_query_regions_spares_mapped_regions() {
        let cache = cache();
        let id = Identifier::single("id", 1);
        let key = EntityCacheKey::new("App\\Entity\\Order", id.clone()).unwrap();
        let order = cache.entity_region("App\\Entity\\Order").unwrap().unwrap();
        order.put(&key, &"entry".to_string()).await.unwrap();

        let reports = cache.query_region(Some("reports"));
        reports.put(&key, &"rows".to_string()).await.unwrap();

        cache.evict_query_regions().await.unwrap();
        assert!(!reports.contains(&key).await.unwrap());
        assert!(cache.contains_entity("App\\Entity\\Order", &id).await.unwrap());
    }
}

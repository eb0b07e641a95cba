//! # orm-cache
//!
//! A second-level cache for object-relational mappers.
//!
//! ## Features
//!
//! - **Regions:** named, namespaced partitions of a key-value backend with lifetimes
//!   and O(1) region-wide eviction
//! - **Concurrency strategies:** read-only, nonstrict-read-write and read-write
//!   (soft locks) per entity, collection and query region
//! - **Hydrators:** entities and collections stored as flat snapshots with
//!   association references, rebuilt through the unit of work
//! - **Query cache:** results invalidated by region timestamps and lifetimes
//! - **Backend Agnostic:** any store implementing [`CacheBackend`]; an in-memory
//!   backend ships behind the default `inmemory` feature
//!
//! ## Quick Start
//!
//! ```ignore
//! use orm_cache::{
//!     backend::InMemoryBackend,
//!     metadata::{CacheAnnotation, ClassMetadata, MetadataRegistry},
//!     CacheConfiguration, CacheMode, CachedEntityPersister, IdentityMap, Identifier,
//!     SecondLevelCache,
//! };
//!
//! // 1. Describe your entities
//! let metadata = MetadataRegistry::new().with(
//!     ClassMetadata::new("Order")
//!         .identifier(["id"])
//!         .field("total")
//!         .cache(CacheAnnotation::read_write()),
//! )?;
//!
//! // 2. Build the cache
//! let cache = SecondLevelCache::new(InMemoryBackend::new(), CacheConfiguration::default(), metadata);
//!
//! // 3. Wrap your repository
//! let orders = CachedEntityPersister::new(&cache, "Order", my_repository)?;
//!
//! // 4. Use it
//! let uow = IdentityMap::new();
//! let order = orders.load_by_id(&Identifier::single("id", 42), &uow, CacheMode::Normal).await?;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod builder;
pub mod cache;
pub mod clock;
pub mod config;
pub mod entity;
pub mod entry;
pub mod error;
pub mod hydrator;
pub mod key;
pub mod metadata;
pub mod mode;
pub mod observability;
pub mod persister;
pub mod query;
pub mod region;
pub mod repository;
pub mod serialization;
pub mod strategy;
pub mod uow;
pub mod value;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use builder::QueryBuilder;
pub use cache::SecondLevelCache;
pub use config::{CacheConfiguration, QueryCacheOptions, RegionsConfiguration};
pub use entity::{Entity, EntityReference, PersistentCollection};
pub use error::{Error, Result};
pub use metadata::CacheUsage;
pub use mode::CacheMode;
pub use persister::{CachedCollectionPersister, CachedEntityPersister, CachedQueryPersister};
pub use repository::{CollectionRepository, EntityRepository, QueryExecutor};
pub use strategy::RegionStrategy;
pub use uow::{HydrationHints, IdentityMap, UnitOfWork};
pub use value::{Identifier, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

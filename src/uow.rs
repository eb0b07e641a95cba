//! Unit-of-work contract consumed by hydrators and persisters.

use crate::entity::Entity;
use crate::key::EntityCacheKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-call hydration flags, threaded explicitly through every hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HydrationHints {
    /// Whether associations may be pulled from the second-level cache.
    pub cache_enabled: bool,
    /// Overwrite already-managed instances with the hydrated data.
    pub refresh: bool,
}

impl HydrationHints {
    pub fn cached() -> Self {
        HydrationHints {
            cache_enabled: true,
            refresh: false,
        }
    }

    pub fn refresh() -> Self {
        HydrationHints {
            cache_enabled: true,
            refresh: true,
        }
    }

    pub fn uncached() -> Self {
        HydrationHints {
            cache_enabled: false,
            refresh: false,
        }
    }
}

impl Default for HydrationHints {
    fn default() -> Self {
        Self::cached()
    }
}

/// Identity management of the surrounding entity manager.
pub trait UnitOfWork: Send + Sync {
    /// Managed instance for `key`, if any.
    fn try_get_by_id(&self, key: &EntityCacheKey) -> Option<Arc<Entity>>;

    /// Register a freshly hydrated entity and return the managed instance.
    ///
    /// An already-managed instance wins unless `hints.refresh` is set.
    fn create_entity(&self, key: &EntityCacheKey, entity: Entity, hints: &HydrationHints) -> Arc<Entity>;

    /// Signal the end of a hydration batch.
    fn hydration_complete(&self);

    /// Signal that the current batch was abandoned halfway. Entities created
    /// since the last completed batch must not be announced as loaded.
    fn hydration_aborted(&self);
}

type PostLoadListener = Box<dyn Fn(&Entity) + Send + Sync>;

/// In-process identity map.
///
/// Entities created during a batch are fired at the post-load listeners once
/// `hydration_complete` is called. An aborted batch detaches them again
/// without notifying anyone.
#[derive(Default)]
pub struct IdentityMap {
    entities: DashMap<EntityCacheKey, Arc<Entity>>,
    pending: Mutex<Vec<(EntityCacheKey, Arc<Entity>)>>,
    listeners: Mutex<Vec<PostLoadListener>>,
    created: AtomicUsize,
    batches: AtomicUsize,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_post_load<F>(&self, listener: F)
    where
        F: Fn(&Entity) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    pub fn contains(&self, key: &EntityCacheKey) -> bool {
        self.entities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Detach one entity.
    pub fn detach(&self, key: &EntityCacheKey) {
        self.entities.remove(key);
    }

    /// Detach everything, like closing the entity manager.
    pub fn clear(&self) {
        self.entities.clear();
        self.pending.lock().clear();
    }

    /// How many instances were registered (refreshes included).
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// How many hydration batches completed.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }
}

impl UnitOfWork for IdentityMap {
    fn try_get_by_id(&self, key: &EntityCacheKey) -> Option<Arc<Entity>> {
        self.entities.get(key).map(|e| e.value().clone())
    }

    fn create_entity(&self, key: &EntityCacheKey, entity: Entity, hints: &HydrationHints) -> Arc<Entity> {
        if !hints.refresh {
            if let Some(existing) = self.entities.get(key) {
                return existing.value().clone();
            }
        }

        let entity = Arc::new(entity);
        self.entities.insert(key.clone(), entity.clone());
        self.pending.lock().push((key.clone(), entity.clone()));
        self.created.fetch_add(1, Ordering::Relaxed);
        entity
    }

    fn hydration_complete(&self) {
        let loaded = std::mem::take(&mut *self.pending.lock());
        let listeners = self.listeners.lock();
        for (_, entity) in &loaded {
            for listener in listeners.iter() {
                listener(entity);
            }
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn hydration_aborted(&self) {
        let discarded = std::mem::take(&mut *self.pending.lock());
        for (key, entity) in &discarded {
            self.entities
                .remove_if(key, |_, current| Arc::ptr_eq(current, entity));
        }
        if !discarded.is_empty() {
            debug!("Discarded {} entities of an abandoned hydration", discarded.len());
        }
    }
}

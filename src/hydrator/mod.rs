//! Hydrators: convert live entities and collections to cache entries and back.

mod collection;
mod entity;

pub use collection::CollectionHydrator;
pub use entity::EntityHydrator;

use crate::entity::Entity;
use crate::key::EntityCacheKey;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Arena of one hydration call.
///
/// Tracks what was already built and what is being built, so that reference
/// cycles resolve to proxies instead of recursing forever. Borrows are never
/// held across an await.
#[derive(Default)]
pub(crate) struct HydrationBatch {
    hydrated: RefCell<HashMap<EntityCacheKey, Arc<Entity>>>,
    in_progress: RefCell<HashSet<EntityCacheKey>>,
}

impl HydrationBatch {
    pub(crate) fn get(&self, key: &EntityCacheKey) -> Option<Arc<Entity>> {
        self.hydrated.borrow().get(key).cloned()
    }

    pub(crate) fn is_in_progress(&self, key: &EntityCacheKey) -> bool {
        self.in_progress.borrow().contains(key)
    }

    fn begin(&self, key: &EntityCacheKey) {
        self.in_progress.borrow_mut().insert(key.clone());
    }

    fn finish(&self, key: &EntityCacheKey, entity: Option<Arc<Entity>>) {
        self.in_progress.borrow_mut().remove(key);
        if let Some(entity) = entity {
            self.hydrated.borrow_mut().insert(key.clone(), entity);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.hydrated.borrow().len()
    }
}

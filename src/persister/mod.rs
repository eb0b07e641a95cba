//! Cache-aware persisters wrapping the database collaborators.
//!
//! Reads go through the cache according to the [`CacheMode`](crate::mode::CacheMode);
//! writes hit the database first and queue their cache action until the
//! surrounding transaction commits or rolls back.

mod collection;
mod entity;
mod query;

pub use collection::CachedCollectionPersister;
pub use entity::CachedEntityPersister;
pub use query::CachedQueryPersister;

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::key::CacheKey;
use crate::region::Lock;
use crate::strategy::RegionStrategy;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A cache write deferred until the transaction outcome is known.
#[derive(Debug)]
pub(crate) enum CacheAction<K, E> {
    Put { key: K, entry: E, lock: Option<Lock> },
    Remove { key: K, lock: Option<Lock> },
}

/// Pending cache actions of the current transaction.
///
/// The mutex is only taken synchronously, never across an await.
pub(crate) struct TransactionQueue<K, E> {
    actions: Mutex<Vec<CacheAction<K, E>>>,
}

impl<K, E> Default for TransactionQueue<K, E> {
    fn default() -> Self {
        TransactionQueue {
            actions: Mutex::new(Vec::new()),
        }
    }
}

impl<K, E> TransactionQueue<K, E>
where
    K: CacheKey,
    E: Serialize + DeserializeOwned + PartialEq,
{
    pub(crate) fn push(&self, action: CacheAction<K, E>) {
        self.actions.lock().push(action);
    }

    pub(crate) fn len(&self) -> usize {
        self.actions.lock().len()
    }

    fn drain(&self) -> Vec<CacheAction<K, E>> {
        std::mem::take(&mut *self.actions.lock())
    }

    /// Apply every queued action. All actions are attempted; the first error
    /// is returned.
    pub(crate) async fn commit<B: CacheBackend>(&self, region: &RegionStrategy<B>) -> Result<()> {
        let mut first_error = None;
        for action in self.drain() {
            let outcome = match &action {
                CacheAction::Put { key, entry, lock } => {
                    region.commit(key, entry, lock.as_ref()).await.map(|_| ())
                }
                CacheAction::Remove { key, lock } => region.remove(key, lock.as_ref()).await,
            };
            if let Err(e) = outcome {
                warn!("Cache action on {} failed after commit: {}", region.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release the locks of every queued action without writing.
    pub(crate) async fn rollback<B: CacheBackend>(&self, region: &RegionStrategy<B>) -> Result<()> {
        let mut first_error = None;
        for action in self.drain() {
            let (key, lock) = match &action {
                CacheAction::Put { key, lock, .. } | CacheAction::Remove { key, lock } => (key, lock),
            };
            if let Err(e) = region.rollback(key, lock.as_ref()).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop queued actions when there is no region to apply them to.
    pub(crate) fn discard(&self) {
        self.drain();
    }
}

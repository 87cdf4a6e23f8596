//! Cache Registry
//!
//! Owns the cache store and hands out one entity cache per name. Aggregates
//! are named in their own table, so an aggregate may share a name with an
//! entity cache.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::aggregate::{AggregateAccessor, AggregateMapping};
use super::{EntityCache, EntityCacheOptions, Entity, StoreAccessor};
use crate::cache::CacheStore;
use crate::config::StoreConfig;
use crate::error::{CacheError, Result};

type AnyCache = Arc<dyn Any + Send + Sync>;

/// Process-scoped registry of named entity caches.
///
/// Create it once at startup and share it. Requesting a name that already
/// exists returns the same instance, provided the value type and options
/// agree.
pub struct CacheRegistry {
    store: Arc<CacheStore>,
    accessor: Arc<StoreAccessor>,
    caches: Mutex<HashMap<String, AnyCache>>,
    aggregates: Mutex<HashMap<String, AnyCache>>,
}

impl CacheRegistry {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            accessor: Arc::new(StoreAccessor::new(Arc::clone(&store))),
            store,
            caches: Mutex::new(HashMap::new()),
            aggregates: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the registry together with its store.
    pub fn from_config(config: StoreConfig) -> Self {
        Self::new(CacheStore::new(config))
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Returns the cache for `name`, creating it on first use.
    ///
    /// Fails with [`CacheError::OptionsChanged`] when the name exists with
    /// different normalized options and with [`CacheError::TypeMismatch`]
    /// when it holds another value type. Neither touches the store.
    pub fn entity<T: Entity>(
        &self,
        name: &str,
        options: Option<&EntityCacheOptions>,
    ) -> Result<Arc<EntityCache<T>>> {
        let mut caches = self.caches.lock();

        if let Some(existing) = caches.get(name) {
            let cache = downcast::<T>(name, existing)?;
            if !cache.are_options_same(options) {
                return Err(CacheError::OptionsChanged(name.to_string()));
            }
            return Ok(cache);
        }

        let cache: Arc<EntityCache<T>> =
            Arc::new(EntityCache::new(self.accessor.clone(), name, options));
        caches.insert(name.to_string(), cache.clone());
        debug!("Registered entity cache {}", name);
        Ok(cache)
    }

    /// Returns the aggregate cache for `name`, creating it from `mapping`
    /// on first use. Later mappings for an existing name are ignored.
    pub fn aggregated<A: Entity>(
        &self,
        name: &str,
        mapping: AggregateMapping,
    ) -> Result<Arc<EntityCache<A>>> {
        let mut aggregates = self.aggregates.lock();

        if let Some(existing) = aggregates.get(name) {
            return downcast::<A>(name, existing);
        }

        let members = mapping.len();
        let cache: Arc<EntityCache<A>> = Arc::new(EntityCache::new(
            Arc::new(AggregateAccessor::new(mapping)),
            name,
            None,
        ));
        aggregates.insert(name.to_string(), cache.clone());
        debug!("Registered aggregate cache {} over {} members", name, members);
        Ok(cache)
    }

    /// Number of registered caches, aggregates included.
    pub fn len(&self) -> usize {
        self.caches.lock().len() + self.aggregates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn persist(&self) {
        self.store.persist();
    }

    pub fn unpersist(&self) {
        self.store.unpersist();
    }
}

fn downcast<T: Entity>(name: &str, cache: &AnyCache) -> Result<Arc<EntityCache<T>>> {
    Arc::clone(cache)
        .downcast::<EntityCache<T>>()
        .map_err(|_| CacheError::TypeMismatch(name.to_string()))
}

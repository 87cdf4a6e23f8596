//! Cache-info accessors
//!
//! The seam between an entity cache and whatever holds its values: the
//! cache store for ordinary entities, or the member caches of an aggregate.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::{Entity, NormalizedOptions};
use crate::cache::{is_truthy, CacheStore, CacheValueInfo};

/// Post-read hydration applied to cached values.
pub type Retrieve<T> = dyn Fn(T) -> T + Send + Sync;

/// Read, write and remove access to cached values of type `T`.
///
/// `id` is the canonical id string (`None` for the singleton slot) and
/// `key` the storage key derived from it.
pub trait CacheInfoAccessor<T>: Send + Sync {
    fn get_cache_value_info(
        &self,
        id: Option<&str>,
        key: &str,
        retrieve: Option<&Retrieve<T>>,
    ) -> Option<CacheValueInfo<T>>;

    /// Returns false when the value was not cached.
    fn set(&self, id: Option<&str>, key: &str, value: &T, options: &NormalizedOptions) -> bool;

    fn remove(&self, id: Option<&str>, key: &str);
}

// == Store Accessor ==
/// Accessor over a [`CacheStore`], converting values through serde.
#[derive(Clone)]
pub struct StoreAccessor {
    store: Arc<CacheStore>,
}

impl StoreAccessor {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }
}

impl<T: Entity> CacheInfoAccessor<T> for StoreAccessor {
    fn get_cache_value_info(
        &self,
        _id: Option<&str>,
        key: &str,
        retrieve: Option<&Retrieve<T>>,
    ) -> Option<CacheValueInfo<T>> {
        let info = self.store.get_cache_value_info(key, None)?;
        let truthy = is_truthy(&info.value);

        let value: T = match serde_json::from_value(info.value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Cached value at {} does not match its entity type: {}", key, e);
                return None;
            }
        };

        Some(CacheValueInfo {
            value: match retrieve {
                Some(retrieve) if truthy => retrieve(value),
                _ => value,
            },
            valid_for_cache: info.valid_for_cache,
            valid_for_preload: info.valid_for_preload,
        })
    }

    fn set(&self, _id: Option<&str>, key: &str, value: &T, options: &NormalizedOptions) -> bool {
        let raw: Value = match serde_json::to_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not encode value for {}: {}", key, e);
                return false;
            }
        };
        self.store.set(key, raw, &options.to_store_options())
    }

    fn remove(&self, _id: Option<&str>, key: &str) {
        self.store.remove(key);
    }
}

//! Aggregate Cache
//!
//! Composes several entity caches into one virtual entity whose value is an
//! object with one property per member cache.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use super::accessor::{CacheInfoAccessor, Retrieve};
use super::{Entity, EntityCache, NormalizedOptions};
use crate::cache::{is_truthy, CacheValueInfo};

/// Type-erased view of an entity cache exchanging JSON values.
pub trait ErasedEntityCache: Send + Sync {
    fn name(&self) -> &str;
    fn info_value(&self, id: Option<&str>) -> Option<CacheValueInfo<Value>>;
    fn set_value(&self, id: Option<&str>, value: Value) -> bool;
    fn remove_id(&self, id: Option<&str>);
}

impl<T: Entity> ErasedEntityCache for EntityCache<T> {
    fn name(&self) -> &str {
        EntityCache::name(self)
    }

    fn info_value(&self, id: Option<&str>) -> Option<CacheValueInfo<Value>> {
        let info = self.get_info(&id)?;
        match serde_json::to_value(&info.value) {
            Ok(value) => Some(info.map(|_| value)),
            Err(e) => {
                warn!("Could not encode member value of {}: {}", self.name(), e);
                None
            }
        }
    }

    fn set_value(&self, id: Option<&str>, value: Value) -> bool {
        match serde_json::from_value::<T>(value) {
            Ok(value) => self.set(&id, &value, None),
            Err(e) => {
                warn!("Aggregate property does not fit {}: {}", self.name(), e);
                false
            }
        }
    }

    fn remove_id(&self, id: Option<&str>) {
        self.remove(&id);
    }
}

/// Property name to member cache, fixed once the aggregate is created.
#[derive(Clone, Default)]
pub struct AggregateMapping {
    members: Vec<(String, Arc<dyn ErasedEntityCache>)>,
}

impl AggregateMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member<T: Entity>(
        mut self,
        property: impl Into<String>,
        cache: Arc<EntityCache<T>>,
    ) -> Self {
        let cache: Arc<dyn ErasedEntityCache> = cache;
        self.members.push((property.into(), cache));
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Accessor reading and writing an aggregate through its member caches.
pub struct AggregateAccessor {
    mapping: AggregateMapping,
}

impl AggregateAccessor {
    pub fn new(mapping: AggregateMapping) -> Self {
        Self { mapping }
    }
}

impl<A: Entity> CacheInfoAccessor<A> for AggregateAccessor {
    /// `None` unless every member has a value for `id`. Validity is the
    /// conjunction of the member flags.
    fn get_cache_value_info(
        &self,
        id: Option<&str>,
        key: &str,
        retrieve: Option<&Retrieve<A>>,
    ) -> Option<CacheValueInfo<A>> {
        let mut object = Map::new();
        let mut valid_for_cache = true;
        let mut valid_for_preload = true;

        for (property, cache) in &self.mapping.members {
            let info = cache.info_value(id)?;
            object.insert(property.clone(), info.value);
            valid_for_cache &= info.valid_for_cache;
            valid_for_preload &= info.valid_for_preload;
        }

        let assembled = Value::Object(object);
        let truthy = is_truthy(&assembled);
        let value: A = match serde_json::from_value(assembled) {
            Ok(value) => value,
            Err(e) => {
                warn!("Members of {} do not assemble into the aggregate: {}", key, e);
                return None;
            }
        };

        Some(CacheValueInfo {
            value: match retrieve {
                Some(retrieve) if truthy => retrieve(value),
                _ => value,
            },
            valid_for_cache,
            valid_for_preload,
        })
    }

    /// Writes each property through its member cache, which applies its
    /// own options.
    fn set(&self, id: Option<&str>, key: &str, value: &A, _options: &NormalizedOptions) -> bool {
        let mut object = match serde_json::to_value(value) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                warn!("Aggregate value for {} is not an object", key);
                return false;
            }
            Err(e) => {
                warn!("Could not encode aggregate value for {}: {}", key, e);
                return false;
            }
        };

        let mut all_written = true;
        for (property, cache) in &self.mapping.members {
            let member_value = object.remove(property).unwrap_or(Value::Null);
            all_written &= cache.set_value(id, member_value);
        }
        all_written
    }

    fn remove(&self, id: Option<&str>, _key: &str) {
        for (_, cache) in &self.mapping.members {
            cache.remove_id(id);
        }
    }
}

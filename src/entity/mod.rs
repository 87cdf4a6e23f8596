//! Entity Module
//!
//! Typed caches over the cache store: per-entity key derivation, cache-aware
//! fetch pipelines, aggregates composed from several caches, and the
//! registry that hands them out by name.

mod accessor;
mod aggregate;
mod entity_cache;
mod id;
mod options;
mod registry;
mod stream;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use accessor::{CacheInfoAccessor, Retrieve, StoreAccessor};
pub use aggregate::{AggregateAccessor, AggregateMapping, ErasedEntityCache};
pub use entity_cache::EntityCache;
pub use id::{CacheId, IdFormatter};
pub use options::{EntityCacheOptions, NormalizedOptions};
pub use registry::CacheRegistry;
pub use stream::distinct_until_changed;

/// Values an entity cache can hold.
pub trait Entity: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {}

impl<T> Entity for T where T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {}

//! Entity Cache - client-side caching for fetched entities
//!
//! Caches values under two expirations: a short window in which a cached
//! value is used without refetching, and a longer window in which it is
//! emitted first while a fresh value is fetched. Entries can be grouped by
//! tag for bulk invalidation, and the store writes through a memory,
//! persistent or hybrid backend.

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod logger;
pub mod storage;
pub mod tasks;

pub use cache::{CacheStore, CacheValueInfo, StoreOptions};
pub use config::{HostContext, StoreConfig};
pub use entity::{
    AggregateMapping, CacheId, CacheRegistry, Entity, EntityCache, EntityCacheOptions, IdFormatter,
};
pub use error::{CacheError, Result, StorageError};
pub use logger::{CacheLogger, TracingLogger};
pub use storage::StorageKind;

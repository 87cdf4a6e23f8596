//! Cache Module
//!
//! Provides the low-level cache store with dual expirations and tag index.

mod entry;
mod store;
mod tags;


// Re-export public types
pub use entry::{
    current_timestamp_ms, is_truthy, CacheValueInfo, StoreOptions, StoredOptions, StoredValue,
    NEVER_EXPIRES,
};
pub use store::{CacheStore, RetrieveValue};
pub use tags::TagIndex;

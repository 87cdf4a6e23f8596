//! Cache Entry Module
//!
//! Defines stored values with dual expirations and their read-time projection.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Expiration sentinel meaning "always valid".
pub const NEVER_EXPIRES: i64 = i64::MAX;

// == Stored Options ==
/// Absolute expirations persisted alongside a value (Unix milliseconds).
///
/// `cache_expires == 0` means the value is never valid for cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOptions {
    pub cache_expires: i64,
    pub preload_expires: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl StoredOptions {
    /// Options used for values written without any expiration.
    pub fn unexpiring() -> Self {
        Self {
            cache_expires: 0,
            preload_expires: NEVER_EXPIRES,
            tag: None,
        }
    }

    pub fn is_valid_for_cache(&self, now: i64) -> bool {
        self.cache_expires != 0 && self.cache_expires > now
    }

    pub fn is_valid_for_preload(&self, now: i64) -> bool {
        self.preload_expires != 0 && self.preload_expires > now
    }

    /// The later of the two expirations.
    pub fn latest_expiration(&self) -> i64 {
        self.cache_expires.max(self.preload_expires)
    }
}

// == Stored Value ==
/// Envelope written to the backend for every cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue<T = Value> {
    pub value: T,
    pub options: StoredOptions,
}

// == Store Options ==
/// Write-time options for [`CacheStore::set`](crate::cache::CacheStore::set).
///
/// For each window an explicit absolute expiry wins over a max age, which
/// wins over the default (never for cache, always for preload). Zero values
/// count as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOptions {
    pub cache_expires: Option<i64>,
    pub preload_expires: Option<i64>,
    pub cache_max_age: Option<Duration>,
    pub preload_max_age: Option<Duration>,
    pub tag: Option<String>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_max_age(mut self, age: Duration) -> Self {
        self.cache_max_age = Some(age);
        self
    }

    pub fn preload_max_age(mut self, age: Duration) -> Self {
        self.preload_max_age = Some(age);
        self
    }

    pub fn cache_expires(mut self, at: i64) -> Self {
        self.cache_expires = Some(at);
        self
    }

    pub fn preload_expires(mut self, at: i64) -> Self {
        self.preload_expires = Some(at);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Whether any cache-window expiration was supplied.
    pub fn has_cache_expiration(&self) -> bool {
        self.cache_expires.is_some_and(|at| at != 0)
            || self.cache_max_age.is_some_and(|age| !age.is_zero())
    }

    /// Converts to absolute expirations relative to `now`.
    pub fn resolve(&self, now: i64) -> StoredOptions {
        let defaults = StoredOptions::unexpiring();
        StoredOptions {
            cache_expires: resolve_window(
                self.cache_expires,
                self.cache_max_age,
                now,
                defaults.cache_expires,
            ),
            preload_expires: resolve_window(
                self.preload_expires,
                self.preload_max_age,
                now,
                defaults.preload_expires,
            ),
            tag: self.tag.clone(),
        }
    }
}

fn resolve_window(at: Option<i64>, age: Option<Duration>, now: i64, default: i64) -> i64 {
    if let Some(at) = at.filter(|at| *at != 0) {
        return at;
    }
    match age.filter(|age| !age.is_zero()) {
        Some(age) => {
            let millis = i64::try_from(age.as_millis()).unwrap_or(NEVER_EXPIRES);
            now.saturating_add(millis)
        }
        None => default,
    }
}

// == Cache Value Info ==
/// Read-time view of a stored value against the current time. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheValueInfo<T> {
    pub value: T,
    pub valid_for_cache: bool,
    pub valid_for_preload: bool,
}

impl<T> CacheValueInfo<T> {
    /// Transforms the value, keeping the validity flags.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheValueInfo<U> {
        CacheValueInfo {
            value: f(self.value),
            valid_for_cache: self.valid_for_cache,
            valid_for_preload: self.valid_for_preload,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// JavaScript-style truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

//! Entity cache options.

use std::time::Duration;

use crate::cache::StoreOptions;

/// Options an entity cache is created or written with.
///
/// `None` in any field means "not supplied". For `tag`, `Some(None)` means
/// explicitly untagged, as opposed to falling back to the default tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityCacheOptions {
    pub tag: Option<Option<String>>,
    pub cache_max_age: Option<Duration>,
    pub preload_max_age: Option<Duration>,
}

impl EntityCacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(Some(tag.into()));
        self
    }

    pub fn untagged(mut self) -> Self {
        self.tag = Some(None);
        self
    }

    pub fn cache_max_age(mut self, age: Duration) -> Self {
        self.cache_max_age = Some(age);
        self
    }

    pub fn preload_max_age(mut self, age: Duration) -> Self {
        self.preload_max_age = Some(age);
        self
    }
}

/// Fully resolved options. Equality of this form decides whether two
/// requests for the same entity name agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedOptions {
    pub tag: Option<String>,
    pub cache_max_age: Option<Duration>,
    pub preload_max_age: Option<Duration>,
}

impl NormalizedOptions {
    /// Zero durations count as absent and a missing tag becomes `default_tag`.
    pub fn normalize(options: Option<&EntityCacheOptions>, default_tag: &str) -> Self {
        let options = options.cloned().unwrap_or_default();
        Self {
            tag: options.tag.unwrap_or_else(|| Some(default_tag.to_string())),
            cache_max_age: non_zero(options.cache_max_age),
            preload_max_age: non_zero(options.preload_max_age),
        }
    }

    /// Fields supplied in `options` override these ones.
    pub fn merged(&self, options: Option<&EntityCacheOptions>) -> Self {
        let Some(options) = options else {
            return self.clone();
        };

        Self {
            tag: options.tag.clone().unwrap_or_else(|| self.tag.clone()),
            cache_max_age: non_zero(options.cache_max_age).or(self.cache_max_age),
            preload_max_age: non_zero(options.preload_max_age).or(self.preload_max_age),
        }
    }

    pub fn has_cache_expiration(&self) -> bool {
        self.cache_max_age.is_some()
    }

    pub fn to_store_options(&self) -> StoreOptions {
        StoreOptions {
            cache_max_age: self.cache_max_age,
            preload_max_age: self.preload_max_age,
            tag: self.tag.clone(),
            ..StoreOptions::default()
        }
    }
}

fn non_zero(age: Option<Duration>) -> Option<Duration> {
    age.filter(|age| !age.is_zero())
}

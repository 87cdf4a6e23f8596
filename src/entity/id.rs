//! Entity ids and cache key derivation.

use std::sync::Arc;

/// Converts an id to the string placed between brackets in a cache key.
///
/// `None` selects the singleton slot of an entity cache.
pub trait CacheId {
    fn cache_id(&self) -> Option<String>;
}

macro_rules! impl_cache_id_display {
    ($($t:ty),* $(,)?) => {
        $(
            impl CacheId for $t {
                fn cache_id(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

impl_cache_id_display!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, char, bool, str, String,
);

impl<T: CacheId + ?Sized> CacheId for &T {
    fn cache_id(&self) -> Option<String> {
        (**self).cache_id()
    }
}

impl<T: CacheId> CacheId for Option<T> {
    fn cache_id(&self) -> Option<String> {
        self.as_ref().and_then(CacheId::cache_id)
    }
}

impl CacheId for () {
    fn cache_id(&self) -> Option<String> {
        None
    }
}

/// Caller-supplied id formatting used in place of [`CacheId::cache_id`].
///
/// Different formatters for the same id address different entries.
pub type IdFormatter<I> = Arc<dyn Fn(&I) -> String + Send + Sync>;

/// Derives storage keys under an entity prefix.
pub(crate) struct KeyBuilder<I: ?Sized> {
    prefix: String,
    format_id: Option<IdFormatter<I>>,
}

impl<I: CacheId + ?Sized> KeyBuilder<I> {
    pub(crate) fn new(prefix: &str, format_id: Option<IdFormatter<I>>) -> Self {
        Self {
            prefix: prefix.to_string(),
            format_id,
        }
    }

    /// `prefix` for the singleton slot, `prefix[id]` otherwise.
    pub(crate) fn key(&self, id: &I) -> String {
        let Some(raw) = id.cache_id() else {
            return self.prefix.clone();
        };
        let formatted = match &self.format_id {
            Some(format) => format(id),
            None => raw,
        };
        format!("{}[{}]", self.prefix, formatted)
    }
}

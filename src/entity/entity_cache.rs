//! Entity Cache
//!
//! Per-entity wrapper turning fetch pipelines into cache-aware pipelines.
//! Keys are `.{name}` for the singleton slot and `.{name}[{id}]` otherwise.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::accessor::{CacheInfoAccessor, Retrieve};
use super::id::{CacheId, IdFormatter, KeyBuilder};
use super::options::{EntityCacheOptions, NormalizedOptions};
use super::stream::{distinct_until_changed, just};
use super::Entity;
use crate::cache::CacheValueInfo;
use crate::error::{CacheError, Result};

/// Writes values flowing through a pipeline back to the cache.
struct WriteBack<T> {
    accessor: Arc<dyn CacheInfoAccessor<T>>,
    options: NormalizedOptions,
}

impl<T> WriteBack<T> {
    fn write(&self, id: Option<&str>, key: &str, value: &T) {
        if !self.accessor.set(id, key, value, &self.options) {
            debug!("Fetched value for {} was not cached", key);
        }
    }

    fn write_map<I: CacheId>(&self, keys: &KeyBuilder<I>, values: &HashMap<I, T>) {
        for (id, value) in values {
            self.write(id.cache_id().as_deref(), &keys.key(id), value);
        }
    }
}

pub struct EntityCache<T> {
    name: String,
    prefix: String,
    accessor: Arc<dyn CacheInfoAccessor<T>>,
    defaults: NormalizedOptions,
    retrieve: RwLock<Option<Arc<Retrieve<T>>>>,
}

impl<T: Entity> EntityCache<T> {
    /// Creates the cache for `name`. A missing tag defaults to `.{name}`.
    pub fn new(
        accessor: Arc<dyn CacheInfoAccessor<T>>,
        name: &str,
        options: Option<&EntityCacheOptions>,
    ) -> Self {
        let prefix = format!(".{}", name);
        let defaults = NormalizedOptions::normalize(options, &prefix);
        Self {
            name: name.to_string(),
            prefix,
            accessor,
            defaults,
            retrieve: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &NormalizedOptions {
        &self.defaults
    }

    pub fn are_options_same(&self, options: Option<&EntityCacheOptions>) -> bool {
        NormalizedOptions::normalize(options, &self.prefix) == self.defaults
    }

    /// Registers a hydration step applied to every truthy value read back.
    pub fn set_retrieve_method<F>(&self, retrieve: F) -> &Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        *self.retrieve.write() = Some(Arc::new(retrieve));
        self
    }

    /// Storage key for `id`.
    pub fn key_for<I: CacheId + ?Sized>(&self, id: &I) -> String {
        KeyBuilder::<I>::new(&self.prefix, None).key(id)
    }

    // == Pipelines ==
    /// Wraps a single-value fetch.
    ///
    /// A cache-valid entry short-circuits without running `upstream`.
    /// Otherwise every fetched value is written back, and with `preload` a
    /// preload-valid entry is emitted first. Equal consecutive values are
    /// emitted once.
    pub fn use_cache<I, S, E>(
        &self,
        id: I,
        preload: bool,
        format_id: Option<IdFormatter<I>>,
        upstream: S,
    ) -> BoxStream<'static, std::result::Result<T, E>>
    where
        I: CacheId,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Send + 'static,
    {
        let raw_id = id.cache_id();
        let key = KeyBuilder::new(&self.prefix, format_id).key(&id);
        let info = self.lookup(raw_id.as_deref(), &key);

        if let Some(info) = &info {
            if info.valid_for_cache {
                debug!("Cache hit for {}", key);
                return just(info.value.clone());
            }
        }

        let writer = self.writer(None);
        let fresh = upstream.inspect_ok(move |value| writer.write(raw_id.as_deref(), &key, value));

        match info {
            Some(info) if preload && info.valid_for_preload => {
                distinct_until_changed(just(info.value).chain(fresh)).boxed()
            }
            _ => fresh.boxed(),
        }
    }

    /// Wraps a batched fetch without splitting it.
    ///
    /// Short-circuits only when a cache max age is configured and every id
    /// is cache-valid. With `preload`, one map of stale values is emitted
    /// first when every id is preload-valid.
    pub fn use_map_cache<I, S, E>(
        &self,
        ids: &[I],
        preload: bool,
        format_id: Option<IdFormatter<I>>,
        upstream: S,
    ) -> BoxStream<'static, std::result::Result<HashMap<I, T>, E>>
    where
        I: CacheId + Eq + Hash + Clone + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<HashMap<I, T>, E>> + Send + 'static,
        E: Send + 'static,
    {
        let keys = KeyBuilder::new(&self.prefix, format_id);
        let info = self.map_cache_info(ids, &keys);

        if self.defaults.has_cache_expiration() {
            if let Some(cached) = collect_valid(ids, &info, |i| i.valid_for_cache) {
                return just(cached);
            }
        }

        let writer = self.writer(None);
        let fresh = upstream.inspect_ok(move |values| writer.write_map(&keys, values));

        if preload {
            if let Some(stale) = collect_valid(ids, &info, |i| i.valid_for_preload) {
                return just(stale).chain(fresh).boxed();
            }
        }
        fresh.boxed()
    }

    /// Fetches only the ids that are not cache-valid.
    ///
    /// `fetch` receives the missing ids and is not called at all when none
    /// are missing. Fetched values win over cached ones for the same id.
    pub fn get_map<I, F, S, E>(
        &self,
        fetch: F,
        ids: &[I],
        preload: bool,
    ) -> BoxStream<'static, std::result::Result<HashMap<I, T>, E>>
    where
        I: CacheId + Eq + Hash + Clone + Send + Sync + 'static,
        F: FnOnce(Vec<I>) -> S,
        S: Stream<Item = std::result::Result<HashMap<I, T>, E>> + Send + 'static,
        E: Send + 'static,
    {
        let keys = KeyBuilder::new(&self.prefix, None);
        let mut info = None;
        let mut request_ids = ids.to_vec();
        let mut existing: HashMap<I, T> = HashMap::new();

        if self.defaults.has_cache_expiration() {
            let cached = self.map_cache_info(ids, &keys);
            existing = ids
                .iter()
                .filter_map(|id| {
                    let hit = cached.get(id).filter(|i| i.valid_for_cache)?;
                    Some((id.clone(), hit.value.clone()))
                })
                .collect();

            if ids.iter().all(|id| existing.contains_key(id)) {
                debug!("All {} ids of {} cached", ids.len(), self.name);
                return just(existing);
            }
            request_ids.retain(|id| !existing.contains_key(id));
            info = Some(cached);
        }

        let stale = if preload {
            let info = info.unwrap_or_else(|| self.map_cache_info(ids, &keys));
            collect_valid(ids, &info, |i| i.valid_for_preload)
        } else {
            None
        };

        debug!("Fetching {} of {} ids of {}", request_ids.len(), ids.len(), self.name);
        let writer = self.writer(None);
        let fresh = fetch(request_ids).map_ok(move |mut fetched| {
            writer.write_map(&keys, &fetched);
            for (id, value) in &existing {
                fetched.entry(id.clone()).or_insert_with(|| value.clone());
            }
            fetched
        });

        match stale {
            Some(stale) => just(stale).chain(fresh).boxed(),
            None => fresh.boxed(),
        }
    }

    /// Stores what flows through the pipeline, or `value` when given,
    /// without changing what flows downstream.
    pub fn set_operator<I, S, E>(
        &self,
        id: I,
        value: Option<T>,
        options: Option<&EntityCacheOptions>,
        upstream: S,
    ) -> BoxStream<'static, std::result::Result<T, E>>
    where
        I: CacheId,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Send + 'static,
    {
        let raw_id = id.cache_id();
        let key = self.key_for(&id);
        let writer = self.writer(options);

        upstream
            .inspect_ok(move |flowing| {
                let stored = value.as_ref().unwrap_or(flowing);
                writer.write(raw_id.as_deref(), &key, stored);
            })
            .boxed()
    }

    // == Direct Access ==
    pub fn get_info<I: CacheId + ?Sized>(&self, id: &I) -> Option<CacheValueInfo<T>> {
        self.lookup(id.cache_id().as_deref(), &self.key_for(id))
    }

    pub fn get<I: CacheId + ?Sized>(&self, id: &I) -> Option<T> {
        self.get_info(id).map(|info| info.value)
    }

    /// Writes `value` with `options` merged over this cache's defaults.
    pub fn set<I: CacheId + ?Sized>(
        &self,
        id: &I,
        value: &T,
        options: Option<&EntityCacheOptions>,
    ) -> bool {
        let options = self.defaults.merged(options);
        self.accessor
            .set(id.cache_id().as_deref(), &self.key_for(id), value, &options)
    }

    /// Mutates the cached value in place and writes it back.
    ///
    /// Returns `Ok(false)` when nothing is cached for `id`. Only values
    /// that serialize to an object or array can be updated.
    pub fn update<I, F>(&self, id: &I, mutator: F, options: Option<&EntityCacheOptions>) -> Result<bool>
    where
        I: CacheId + ?Sized,
        F: FnOnce(&mut T),
    {
        let Some(mut current) = self.get(id) else {
            return Ok(false);
        };

        match serde_json::to_value(&current)? {
            Value::Object(_) | Value::Array(_) => {}
            other => return Err(CacheError::UnsupportedUpdate(json_kind(&other).to_string())),
        }

        mutator(&mut current);
        Ok(self.set(id, &current, options))
    }

    pub fn remove<I: CacheId + ?Sized>(&self, id: &I) {
        self.accessor.remove(id.cache_id().as_deref(), &self.key_for(id));
    }

    // == Helpers ==
    fn lookup(&self, id: Option<&str>, key: &str) -> Option<CacheValueInfo<T>> {
        let retrieve = self.retrieve.read().clone();
        self.accessor.get_cache_value_info(id, key, retrieve.as_deref())
    }

    fn map_cache_info<I>(&self, ids: &[I], keys: &KeyBuilder<I>) -> HashMap<I, CacheValueInfo<T>>
    where
        I: CacheId + Eq + Hash + Clone,
    {
        ids.iter()
            .filter_map(|id| {
                let info = self.lookup(id.cache_id().as_deref(), &keys.key(id))?;
                Some((id.clone(), info))
            })
            .collect()
    }

    fn writer(&self, options: Option<&EntityCacheOptions>) -> WriteBack<T> {
        WriteBack {
            accessor: Arc::clone(&self.accessor),
            options: self.defaults.merged(options),
        }
    }
}

impl<T> std::fmt::Debug for EntityCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("name", &self.name)
            .field("options", &self.defaults)
            .finish()
    }
}

/// Values for every id when each one passes `valid`, otherwise `None`.
fn collect_valid<I, T>(
    ids: &[I],
    info: &HashMap<I, CacheValueInfo<T>>,
    valid: impl Fn(&CacheValueInfo<T>) -> bool,
) -> Option<HashMap<I, T>>
where
    I: Eq + Hash + Clone,
    T: Clone,
{
    ids.iter()
        .map(|id| {
            let info = info.get(id).filter(|i| valid(*i))?;
            Some((id.clone(), info.value.clone()))
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::StoreConfig;
    use crate::entity::StoreAccessor;
    use crate::logger::testing::RecordingLogger;
    use crate::storage::MediumProvider;
    use futures::stream;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn user(id: u32, name: &str) -> User {
        User {
            id,
            name: name.to_string(),
        }
    }

    fn accessor() -> Arc<StoreAccessor> {
        let no_medium: MediumProvider = Arc::new(|| None);
        let store = CacheStore::with_medium(
            StoreConfig::default(),
            no_medium,
            Arc::new(RecordingLogger::default()),
        );
        Arc::new(StoreAccessor::new(store))
    }

    fn cache<T: Entity>(options: Option<&EntityCacheOptions>) -> EntityCache<T> {
        EntityCache::new(accessor(), "User", options)
    }

    fn cached_minute() -> EntityCacheOptions {
        EntityCacheOptions::new().cache_max_age(Duration::from_secs(60))
    }

    fn collect<T>(pipeline: BoxStream<'static, std::result::Result<T, ()>>) -> Vec<T> {
        tokio_test::block_on(pipeline.try_collect())
            .unwrap_or_else(|_| panic!("pipeline failed"))
    }

    fn fetch_once<T: Send + 'static>(
        value: T,
        calls: &Arc<AtomicUsize>,
    ) -> BoxStream<'static, std::result::Result<T, ()>> {
        let calls = Arc::clone(calls);
        stream::once(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
        .boxed()
    }

    #[test]
    fn test_keys() {
        let users = cache::<User>(None);
        assert_eq!(users.key_for(&1u32), ".User[1]");
        assert_eq!(users.key_for(&()), ".User");
        assert_eq!(users.key_for("abc"), ".User[abc]");
    }

    #[test]
    fn test_set_and_get() {
        let users = cache::<User>(Some(&cached_minute()));
        assert!(users.set(&1u32, &user(1, "Ann"), None));

        let info = users.get_info(&1u32).unwrap();
        assert_eq!(info.value, user(1, "Ann"));
        assert!(info.valid_for_cache);
        assert!(users.get(&2u32).is_none());
    }

    #[test]
    fn test_singleton_slot() {
        let settings = cache::<Vec<String>>(None);
        settings.set(&(), &vec!["a".to_string()], None);
        assert_eq!(settings.get(&None::<u32>), Some(vec!["a".to_string()]));
    }

    #[test]
    fn test_options_same() {
        let users = cache::<User>(Some(&cached_minute()));
        assert!(users.are_options_same(Some(&cached_minute())));
        assert!(!users.are_options_same(None));
        assert!(!users.are_options_same(Some(&cached_minute().tag("other"))));
    }

    #[test]
    fn test_use_cache_short_circuits_on_cache_hit() {
        let users = cache::<User>(Some(&cached_minute()));
        users.set(&1u32, &user(1, "cached"), None);
        let calls = Arc::new(AtomicUsize::new(0));

        let out = collect(users.use_cache(1u32, true, None, fetch_once(user(1, "fresh"), &calls)));

        assert_eq!(out, vec![user(1, "cached")]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_use_cache_preload_then_fresh() {
        let users = cache::<User>(None);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = collect(users.use_cache(1u32, true, None, fetch_once(user(1, "v1"), &calls)));
        assert_eq!(first, vec![user(1, "v1")]);

        let second = collect(users.use_cache(1u32, true, None, fetch_once(user(1, "v2"), &calls)));
        assert_eq!(second, vec![user(1, "v1"), user(1, "v2")]);

        let third = collect(users.use_cache(1u32, true, None, fetch_once(user(1, "v2"), &calls)));
        assert_eq!(third, vec![user(1, "v2")]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_use_cache_without_preload_emits_fresh_only() {
        let users = cache::<User>(None);
        users.set(&1u32, &user(1, "old"), None);
        let calls = Arc::new(AtomicUsize::new(0));

        let out = collect(users.use_cache(1u32, false, None, fetch_once(user(1, "new"), &calls)));
        assert_eq!(out, vec![user(1, "new")]);
        assert_eq!(users.get(&1u32), Some(user(1, "new")));
    }

    #[test]
    fn test_use_cache_error_does_not_write() {
        let users = cache::<User>(None);
        let failing = stream::once(async { Err::<User, &str>("offline") }).boxed();

        let out: Vec<_> = tokio_test::block_on(users.use_cache(1u32, true, None, failing).collect());
        assert_eq!(out, vec![Err("offline")]);
        assert!(users.get(&1u32).is_none());
    }

    #[test]
    fn test_use_cache_formatter_uses_distinct_entries() {
        let users = cache::<User>(Some(&cached_minute()));
        users.set(&7u32, &user(7, "plain"), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let padded: IdFormatter<u32> = Arc::new(|id| format!("{:03}", id));

        let out = collect(users.use_cache(7u32, true, Some(padded), fetch_once(user(7, "padded"), &calls)));

        assert_eq!(out, vec![user(7, "padded")]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(users.get(&7u32), Some(user(7, "plain")));
        assert_eq!(users.get("007"), Some(user(7, "padded")));
    }

    #[test]
    fn test_use_map_cache_short_circuit_requires_expiry() {
        let users = cache::<User>(None);
        users.set(&1u32, &user(1, "a"), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetched = HashMap::from([(1u32, user(1, "b"))]);

        let out = collect(users.use_map_cache(&[1u32], true, None, fetch_once(fetched, &calls)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0][&1], user(1, "a"));
        assert_eq!(out[1][&1], user(1, "b"));
    }

    #[test]
    fn test_use_map_cache_does_not_split_batches() {
        let users = cache::<User>(Some(&cached_minute()));
        users.set(&1u32, &user(1, "a"), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetched = HashMap::from([(1u32, user(1, "a2")), (2u32, user(2, "b"))]);

        let out = collect(users.use_map_cache(&[1u32, 2], true, None, fetch_once(fetched, &calls)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Not every id was preload-valid, so no stale map
        assert_eq!(out.len(), 1);
        assert_eq!(users.get(&2u32), Some(user(2, "b")));

        let again = collect(users.use_map_cache(&[1u32, 2], true, None, fetch_once(HashMap::new(), &calls)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(again[0][&1], user(1, "a2"));
    }

    #[test]
    fn test_get_map_fetches_only_missing_ids() {
        let users = cache::<User>(Some(&cached_minute()));
        users.set(&54u32, &user(54, "a"), None);
        users.set(&65u32, &user(65, "b"), None);
        let requested = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen = Arc::clone(&requested);
        let out = collect(users.get_map(
            move |ids: Vec<u32>| {
                seen.lock().extend(ids.iter().copied());
                stream::once(async move {
                    Ok(ids.into_iter().map(|id| (id, user(id, "new"))).collect())
                })
                .boxed()
            },
            &[65u32, 54, 103],
            false,
        ));

        assert_eq!(*requested.lock(), vec![103]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 3);
        assert_eq!(out[0][&54], user(54, "a"));
        assert_eq!(out[0][&103], user(103, "new"));
        assert_eq!(users.get(&103u32), Some(user(103, "new")));
    }

    #[test]
    fn test_get_map_all_cached_skips_fetch() {
        let users = cache::<User>(Some(&cached_minute()));
        users.set(&1u32, &user(1, "a"), None);

        let out = collect(users.get_map(
            |_ids: Vec<u32>| -> BoxStream<'static, std::result::Result<HashMap<u32, User>, ()>> {
                panic!("fetch must not run")
            },
            &[1u32],
            true,
        ));
        assert_eq!(out, vec![HashMap::from([(1u32, user(1, "a"))])]);
    }

    #[test]
    fn test_get_map_fetched_values_win() {
        let users = cache::<User>(Some(&cached_minute()));
        users.set(&1u32, &user(1, "cached"), None);

        let out = collect(users.get_map(
            |_ids: Vec<u32>| {
                stream::once(async {
                    Ok(HashMap::from([(1u32, user(1, "fetched")), (2u32, user(2, "b"))]))
                })
                .boxed()
            },
            &[1u32, 2],
            false,
        ));
        assert_eq!(out[0][&1], user(1, "fetched"));
    }

    #[test]
    fn test_get_map_preload_requires_every_id() {
        let users = cache::<User>(None);
        users.set(&1u32, &user(1, "a"), None);
        users.set(&2u32, &user(2, "b"), None);
        let fetch = |ids: Vec<u32>| {
            stream::once(async move {
                Ok::<_, ()>(ids.into_iter().map(|id| (id, user(id, "new"))).collect::<HashMap<_, _>>())
            })
            .boxed()
        };

        let both = collect(users.get_map(fetch, &[1u32, 2], true));
        assert_eq!(both.len(), 2);
        assert_eq!(both[0][&1], user(1, "a"));
        assert_eq!(both[1][&1], user(1, "new"));

        let partial = collect(users.get_map(fetch, &[1u32, 3], true));
        assert_eq!(partial.len(), 1);
    }

    #[test]
    fn test_update_mutates_composite_values() {
        let users = cache::<User>(None);
        users.set(&1u32, &user(1, "Ann"), None);

        let updated = users.update(&1u32, |u| u.name.push_str(" Lee"), None).unwrap();
        assert!(updated);
        assert_eq!(users.get(&1u32).unwrap().name, "Ann Lee");
    }

    #[test]
    fn test_update_missing_is_noop() {
        let users = cache::<User>(None);
        let updated = users.update(&1u32, |_| panic!("no value"), None).unwrap();
        assert!(!updated);
    }

    #[test]
    fn test_update_rejects_scalars() {
        let counters = cache::<u64>(None);
        counters.set(&1u32, &5, None);

        let err = counters.update(&1u32, |n| *n += 1, None).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedUpdate(ref kind) if kind == "number"));
        assert_eq!(counters.get(&1u32), Some(5));
    }

    #[test]
    fn test_remove() {
        let users = cache::<User>(None);
        users.set(&1u32, &user(1, "a"), None);
        users.remove(&1u32);
        assert!(users.get_info(&1u32).is_none());
    }

    #[test]
    fn test_set_operator_passes_values_through() {
        let users = cache::<User>(None);
        let upstream = stream::iter(vec![Ok::<_, ()>(user(1, "a"))]);

        let out = collect(users.set_operator(1u32, None, None, upstream));
        assert_eq!(out, vec![user(1, "a")]);
        assert_eq!(users.get(&1u32), Some(user(1, "a")));

        let upstream = stream::iter(vec![Ok::<_, ()>(user(2, "flowing"))]);
        let out = collect(users.set_operator(2u32, Some(user(2, "fixed")), None, upstream));
        assert_eq!(out, vec![user(2, "flowing")]);
        assert_eq!(users.get(&2u32), Some(user(2, "fixed")));
    }

    #[test]
    fn test_retrieve_method_hydrates_reads() {
        let users = cache::<User>(None);
        users.set_retrieve_method(|mut u: User| {
            u.name = u.name.to_uppercase();
            u
        });
        users.set(&1u32, &user(1, "ann"), None);

        assert_eq!(users.get(&1u32).unwrap().name, "ANN");
    }
}

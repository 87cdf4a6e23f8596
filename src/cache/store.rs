//! Cache Store Module
//!
//! Key/value store with dual expirations, tag index and expiration sweep,
//! writing through whichever backend the configuration resolves to.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    current_timestamp_ms, is_truthy, CacheValueInfo, StoreOptions, StoredOptions, StoredValue,
    TagIndex,
};
use crate::config::{HostContext, StoreConfig};
use crate::logger::{CacheLogger, TracingLogger};
use crate::storage::{
    Backend, BackendContext, FileMedium, MediumProvider, MemoryStorage, StorageBackend,
    StorageKind, StorageMedium,
};
use crate::tasks::spawn_sweep_task;

const TAGS_SUFFIX: &str = "_tags";
const OVERSIZED_SUFFIX: &str = "_oversized";

/// Post-read transform applied to a raw stored value.
pub type RetrieveValue<'a> = &'a (dyn Fn(Value) -> Value + Send + Sync);

// == Store Inner ==
/// State guarded by the store lock. Every method here runs with the lock held.
struct StoreInner {
    backend: Backend,
    prefix: String,
    oversized_threshold: usize,
}

impl StoreInner {
    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn tags_key(&self) -> String {
        self.storage_key(TAGS_SUFFIX)
    }

    fn oversized_key(&self) -> String {
        self.storage_key(OVERSIZED_SUFFIX)
    }

    fn is_system_key(&self, storage_key: &str) -> bool {
        storage_key == self.tags_key() || storage_key == self.oversized_key()
    }

    fn read_system<T: DeserializeOwned>(&mut self, storage_key: &str, force: bool) -> Option<T> {
        let raw = self.backend.get_item(storage_key, force)?;
        match serde_json::from_value::<StoredValue<T>>(raw) {
            Ok(stored) => Some(stored.value),
            Err(e) => {
                warn!("Ignoring unreadable system entry {}: {}", storage_key, e);
                None
            }
        }
    }

    fn write_system<T: Serialize>(&mut self, storage_key: &str, value: &T) -> bool {
        let stored = StoredValue {
            value,
            options: StoredOptions::unexpiring(),
        };
        match serde_json::to_value(&stored) {
            Ok(raw) => self.backend.set_item(storage_key, raw).is_some(),
            Err(e) => {
                warn!("Could not encode system entry {}: {}", storage_key, e);
                false
            }
        }
    }

    fn tag_index(&mut self) -> TagIndex {
        let tags_key = self.tags_key();
        self.read_system(&tags_key, false).unwrap_or_default()
    }

    fn add_to_tag(&mut self, tag: &str, storage_key: &str) {
        let mut index = self.tag_index();
        if index.add(tag, storage_key) {
            let tags_key = self.tags_key();
            self.write_system(&tags_key, &index);
        }
    }

    fn remove_from_tag(&mut self, storage_key: &str) {
        let mut index = self.tag_index();
        if index.remove_key(storage_key) {
            let tags_key = self.tags_key();
            self.write_system(&tags_key, &index);
        }
    }

    fn add_oversized(&mut self, storage_key: &str) {
        let oversized_key = self.oversized_key();
        let mut keys: Vec<String> = self.read_system(&oversized_key, false).unwrap_or_default();
        if keys.iter().any(|k| k == storage_key) {
            return;
        }
        keys.push(storage_key.to_string());
        self.write_system(&oversized_key, &keys);
    }

    fn remove_entry(&mut self, storage_key: &str, recheck: bool) {
        self.backend.remove_item(storage_key);
        if self.ensure_enabled(recheck) {
            self.remove_from_tag(storage_key);
        }
    }

    /// Reports whether the backend accepts writes, evicting oversized
    /// entries and finally clearing the backend when it does not.
    fn ensure_enabled(&mut self, recheck: bool) -> bool {
        if self.backend.is_enabled(recheck) {
            return true;
        }

        let kind = self.backend.kind();
        warn!("Storage backend {} is disabled, evicting oversized entries", kind);

        let oversized_key = self.oversized_key();
        let oversized: Vec<String> = self.read_system(&oversized_key, true).unwrap_or_default();
        for key in &oversized {
            self.backend.remove_item(key);
        }
        self.write_system(&oversized_key, &Vec::<String>::new());

        if self.backend.is_enabled(true) {
            for key in &oversized {
                self.remove_from_tag(key);
            }
            info!("Storage backend {} recovered after evicting {} entries", kind, oversized.len());
            return true;
        }

        warn!("Storage backend {} still disabled, clearing it", kind);
        self.backend.clear();
        self.backend.is_enabled(true)
    }

    fn item_expirations(&mut self) -> BTreeMap<String, i64> {
        let index = self.tag_index();
        index
            .all_keys()
            .map(|key| {
                let expires = self
                    .backend
                    .get_item(key, false)
                    .and_then(|raw| serde_json::from_value::<StoredValue>(raw).ok())
                    .map_or(0, |stored| stored.options.latest_expiration());
                (key.to_string(), expires)
            })
            .collect()
    }
}

// == Cache Store ==
/// Low-level cache over a resolved storage backend.
///
/// All operations take `&self`; the backend sits behind a single lock that
/// every operation acquires once, so each call is atomic with respect to
/// the others.
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    logger: Arc<dyn CacheLogger>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a store logging advisories through `tracing`.
    ///
    /// Durable kinds use a file medium under `config.persist_dir`; without
    /// one they are reported unavailable and the next kind is tried.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Self::with_logger(config, Arc::new(TracingLogger))
    }

    pub fn with_logger(config: StoreConfig, logger: Arc<dyn CacheLogger>) -> Arc<Self> {
        let medium = file_medium_provider(config.persist_dir.clone());
        Self::with_medium(config, medium, logger)
    }

    /// Creates a store whose durable kinds write to media from `medium`.
    pub fn with_medium(
        config: StoreConfig,
        medium: MediumProvider,
        logger: Arc<dyn CacheLogger>,
    ) -> Arc<Self> {
        let ctx = BackendContext {
            prefix: config.key_prefix.clone(),
            medium,
            flush_interval: config.flush_interval(),
            expiry_tolerance: config.expiry_tolerance,
        };
        let backend = resolve_backend(&config, &ctx, logger.as_ref());
        info!(
            "Cache store using {} backend with prefix {}",
            backend.kind(),
            config.key_prefix
        );

        let store = Arc::new(Self {
            inner: Mutex::new(StoreInner {
                backend,
                prefix: config.key_prefix.clone(),
                oversized_threshold: config.oversized_threshold,
            }),
            logger,
            sweep_task: Mutex::new(None),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                let handle = spawn_sweep_task(
                    Arc::downgrade(&store),
                    config.sweep_delay(),
                    config.sweep_interval(),
                );
                *store.sweep_task.lock() = Some(handle);
            }
            Err(_) => debug!("No tokio runtime, expiration sweep runs only on demand"),
        }

        store
    }

    // == Set ==
    /// Stores `value` under `key`. Returns false when the backend refused it.
    pub fn set(&self, key: &str, value: Value, options: &StoreOptions) -> bool {
        let mut inner = self.inner.lock();
        if !inner.ensure_enabled(false) {
            return false;
        }

        let storage_key = inner.storage_key(key);
        let stored = StoredValue {
            value,
            options: options.resolve(current_timestamp_ms()),
        };
        let raw = match serde_json::to_value(&stored) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not encode {}: {}", storage_key, e);
                return false;
            }
        };

        let Some(footprint) = inner.backend.set_item(&storage_key, raw) else {
            debug!("Backend rejected write of {}", storage_key);
            inner.ensure_enabled(true);
            return false;
        };

        if let Some(tag) = options.tag.as_deref() {
            if !inner.is_system_key(&storage_key) {
                inner.add_to_tag(tag, &storage_key);
            }
        }
        if footprint > inner.oversized_threshold && !options.has_cache_expiration() {
            debug!("Tracking oversized entry {} ({} bytes)", storage_key, footprint);
            inner.add_oversized(&storage_key);
        }

        true
    }

    // == Get ==
    /// Reads `key` with its validity flags.
    ///
    /// Entries valid for neither window are removed on the spot. `retrieve`
    /// runs outside the store lock and only for truthy values.
    pub fn get_cache_value_info(
        &self,
        key: &str,
        retrieve: Option<RetrieveValue<'_>>,
    ) -> Option<CacheValueInfo<Value>> {
        let info = {
            let mut inner = self.inner.lock();
            if !inner.ensure_enabled(false) {
                return None;
            }

            let storage_key = inner.storage_key(key);
            let raw = inner.backend.get_item(&storage_key, false)?;
            let stored: StoredValue = match serde_json::from_value(raw) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("Ignoring malformed entry {}: {}", storage_key, e);
                    return None;
                }
            };

            let now = current_timestamp_ms();
            let valid_for_cache = stored.options.is_valid_for_cache(now);
            let valid_for_preload = stored.options.is_valid_for_preload(now);
            if !valid_for_cache && !valid_for_preload {
                debug!("Removing expired entry {}", storage_key);
                inner.remove_entry(&storage_key, false);
                return None;
            }

            CacheValueInfo {
                value: stored.value,
                valid_for_cache,
                valid_for_preload,
            }
        };

        Some(match retrieve {
            Some(retrieve) if is_truthy(&info.value) => info.map(retrieve),
            _ => info,
        })
    }

    /// Value of `key` while it is valid for cache.
    pub fn get_cache(&self, key: &str, retrieve: Option<RetrieveValue<'_>>) -> Option<Value> {
        self.get_cache_value_info(key, retrieve)
            .filter(|info| info.valid_for_cache)
            .map(|info| info.value)
    }

    /// Value of `key` while it is valid for preload.
    pub fn get_preload(&self, key: &str, retrieve: Option<RetrieveValue<'_>>) -> Option<Value> {
        self.get_cache_value_info(key, retrieve)
            .filter(|info| info.valid_for_preload)
            .map(|info| info.value)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get_cache_value_info(key, None).is_some()
    }

    // == Remove ==
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        let storage_key = inner.storage_key(key);
        inner.remove_entry(&storage_key, false);
    }

    pub fn remove_all(&self) {
        let mut inner = self.inner.lock();
        if inner.ensure_enabled(false) {
            inner.backend.clear();
        }
    }

    // == Tags ==
    /// Live entries registered under `tag`, keyed without the store prefix.
    ///
    /// `None` when the tag is unknown or lists no keys.
    pub fn get_tag_data(&self, tag: &str) -> Option<BTreeMap<String, CacheValueInfo<Value>>> {
        let keys: Vec<String> = {
            let mut inner = self.inner.lock();
            if !inner.ensure_enabled(false) {
                return None;
            }
            let index = inner.tag_index();
            let keys = index.keys(tag).filter(|keys| !keys.is_empty())?;
            keys.iter()
                .map(|k| k.strip_prefix(inner.prefix.as_str()).unwrap_or(k).to_string())
                .collect()
        };

        Some(
            keys.into_iter()
                .filter_map(|key| {
                    let info = self.get_cache_value_info(&key, None)?;
                    Some((key, info))
                })
                .collect(),
        )
    }

    /// Removes every entry registered under `tag`, then the tag itself.
    pub fn remove_tag(&self, tag: &str) {
        let mut inner = self.inner.lock();
        if !inner.ensure_enabled(false) {
            return;
        }

        let mut index = inner.tag_index();
        if let Some(keys) = index.take(tag) {
            debug!("Removing {} entries tagged {}", keys.len(), tag);
            for key in &keys {
                inner.backend.remove_item(key);
            }
            let tags_key = inner.tags_key();
            inner.write_system(&tags_key, &index);
        }
    }

    // == Expiration ==
    /// Later of the two expirations for every tag-indexed storage key.
    pub fn item_expirations(&self) -> BTreeMap<String, i64> {
        let mut inner = self.inner.lock();
        if !inner.ensure_enabled(false) {
            return BTreeMap::new();
        }
        inner.item_expirations()
    }

    /// Removes tag-indexed entries whose later expiration has passed.
    ///
    /// Returns the number of entries removed. Untagged entries are only
    /// expired when read.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        if !inner.ensure_enabled(false) {
            return 0;
        }

        let now = current_timestamp_ms();
        let expired: Vec<String> = inner
            .item_expirations()
            .into_iter()
            .filter(|(_, expires)| *expires < now)
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            inner.remove_entry(key, false);
        }
        expired.len()
    }

    // == Backend Control ==
    pub fn set_global_prefix(&self, prefix: impl Into<String>) {
        self.inner.lock().prefix = prefix.into();
    }

    pub fn key_prefix(&self) -> String {
        self.inner.lock().prefix.clone()
    }

    /// Kind of the backend resolved at construction.
    pub fn storage_kind(&self) -> StorageKind {
        self.inner.lock().backend.kind()
    }

    pub fn persist(&self) {
        self.inner.lock().backend.persist();
    }

    /// Stops durable writes and clears durable keys under the store prefix.
    pub fn unpersist(&self) {
        let mut inner = self.inner.lock();
        let prefix = inner.prefix.clone();
        inner.backend.unpersist(&prefix);
    }

    pub fn logger(&self) -> &Arc<dyn CacheLogger> {
        &self.logger
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }
    }
}

// == Backend Resolution ==
/// Picks the first configured kind that builds and reports enabled,
/// falling back to memory. Host mismatches are reported, never fatal.
fn resolve_backend(
    config: &StoreConfig,
    ctx: &BackendContext,
    logger: &dyn CacheLogger,
) -> Backend {
    let resolved = config.storages.iter().find_map(|&kind| {
        let mut backend = Backend::build(kind, ctx)?;
        if backend.is_enabled(false) {
            Some(backend)
        } else {
            debug!("Storage backend {} is not available", kind);
            None
        }
    });

    let Some(backend) = resolved else {
        logger.error(
            "Cache storage type is not defined | It can lead to unexpected behavior \
             or some missed data if/when the process restarts",
        );
        return Backend::Memory(MemoryStorage::new());
    };

    match config.host {
        HostContext::LongLived => {
            let durable_requested = config.storages.iter().any(|kind| kind.is_durable());
            if backend.kind() == StorageKind::Memory && durable_requested {
                logger.error(
                    "It is using MEMORY cache storage type in a long-lived host | The expected \
                     storage type is durable | It can lead to missed data if/when the process restarts",
                );
            }
        }
        HostContext::ShortLived => {
            if backend.kind() != StorageKind::Memory {
                logger.error(
                    "It is NOT using MEMORY cache storage type in a short-lived host | The \
                     expected storage type is memory | It can lead to unexpected behavior",
                );
            }
        }
    }

    backend
}

fn file_medium_provider(dir: Option<PathBuf>) -> MediumProvider {
    Arc::new(move || {
        let dir = dir.as_ref()?;
        match FileMedium::open(dir) {
            Ok(medium) => Some(Box::new(medium) as Box<dyn StorageMedium>),
            Err(e) => {
                warn!("Could not open cache directory {}: {}", dir.display(), e);
                None
            }
        }
    })
}

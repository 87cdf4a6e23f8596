//! Hybrid Storage
//!
//! Keeps the working set in memory and writes it back to a persistent
//! backend on a timer. Writes that would not change what a reader observes
//! are dropped before they reach the pending list, including refreshes of a
//! cached entry whose payload is unchanged and whose expirations moved by
//! less than a relative tolerance.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PersistentStorage, StorageBackend, StorageKind};
use crate::cache::current_timestamp_ms;
use crate::tasks::spawn_flush_task;

/// Flush interval used when none is configured.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

pub(crate) struct HybridState {
    persistent: PersistentStorage,
    data: BTreeMap<String, Value>,
    changed: Vec<String>,
    removed: Vec<String>,
    persisting: bool,
    tolerance: f64,
}

impl HybridState {
    /// Writes pending removals, then the current value of every changed key.
    ///
    /// Returns the number of keys touched. Keys the persistent backend
    /// rejects stay pending. While un-persisted nothing is written and the
    /// pending lists keep growing.
    pub(crate) fn flush(&mut self) -> usize {
        if !self.persisting {
            return 0;
        }

        let removed = std::mem::take(&mut self.removed);
        for key in &removed {
            self.persistent.remove_item(key);
        }

        let changed = std::mem::take(&mut self.changed);
        let mut written = 0;
        let mut failed = Vec::new();
        for key in changed {
            let Some(value) = self.data.get(&key).cloned() else {
                continue;
            };
            match self.persistent.set_item(&key, value) {
                Some(_) => written += 1,
                None => failed.push(key),
            }
        }

        if !failed.is_empty() {
            warn!("Hybrid flush could not write {} keys, retrying later", failed.len());
            self.changed = failed;
        }

        if !removed.is_empty() || written > 0 {
            debug!(
                "Hybrid flush: removed {} keys, wrote {} keys",
                removed.len(),
                written
            );
        }
        removed.len() + written
    }

    fn mark_changed(&mut self, key: &str) {
        if !self.changed.iter().any(|k| k == key) {
            self.changed.push(key.to_string());
        }
    }

    fn mark_removed(&mut self, key: &str) {
        if !self.removed.iter().any(|k| k == key) {
            self.removed.push(key.to_string());
        }
    }
}

pub struct HybridStorage {
    state: Arc<Mutex<HybridState>>,
    flush_task: Option<JoinHandle<()>>,
}

impl HybridStorage {
    /// Loads every persistent key starting with `prefix` and, when a tokio
    /// runtime is available, starts the periodic flush.
    pub fn new(
        prefix: &str,
        mut persistent: PersistentStorage,
        flush_interval: Duration,
        tolerance: f64,
    ) -> Self {
        let data = load(prefix, &mut persistent);
        debug!("Hybrid storage loaded {} keys under {}", data.len(), prefix);

        let state = Arc::new(Mutex::new(HybridState {
            persistent,
            data,
            changed: Vec::new(),
            removed: Vec::new(),
            persisting: true,
            tolerance,
        }));

        let flush_task = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(spawn_flush_task(Arc::downgrade(&state), flush_interval)),
            Err(_) => {
                debug!("No tokio runtime, hybrid storage flushes only on demand");
                None
            }
        };

        Self { state, flush_task }
    }

    /// Runs one flush round immediately.
    pub fn flush(&self) -> usize {
        self.state.lock().flush()
    }

    /// Number of keys waiting to be written or removed.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.changed.len() + state.removed.len()
    }

    /// Stops the periodic flush. Pending changes are not written.
    pub fn destroy(&mut self) {
        if let Some(handle) = self.flush_task.take() {
            handle.abort();
        }
    }
}

impl Drop for HybridStorage {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl StorageBackend for HybridStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Hybrid
    }

    fn is_enabled(&mut self, recheck: bool) -> bool {
        self.state.lock().persistent.is_enabled(recheck)
    }

    fn get_item(&mut self, key: &str, _force: bool) -> Option<Value> {
        self.state
            .lock()
            .data
            .get(key)
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn set_item(&mut self, key: &str, value: Value) -> Option<usize> {
        let mut state = self.state.lock();
        let existing = state.data.get(key).filter(|v| !v.is_null());

        let unchanged = match existing {
            None => value.is_null(),
            Some(existing) => {
                *existing == value
                    || is_expiry_refresh(existing, &value, state.tolerance, current_timestamp_ms())
            }
        };
        if unchanged {
            return Some(1);
        }

        state.data.insert(key.to_string(), value);
        state.mark_changed(key);
        Some(1)
    }

    fn remove_item(&mut self, key: &str) {
        let mut state = self.state.lock();
        state.data.remove(key);
        state.mark_removed(key);
    }

    fn clear(&mut self) {
        let mut state = self.state.lock();
        let keys: Vec<String> = state.data.keys().cloned().collect();
        for key in &keys {
            state.mark_removed(key);
        }
        state.changed.clear();
        state.data.clear();
    }

    fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.state.lock().data.keys().nth(index).cloned()
    }

    fn persist(&mut self) {
        let mut state = self.state.lock();
        if state.persisting {
            return;
        }

        state.persisting = true;
        let keys: Vec<String> = state.data.keys().cloned().collect();
        for key in &keys {
            state.mark_changed(key);
        }
        state.flush();
    }

    fn unpersist(&mut self, prefix: &str) {
        let mut state = self.state.lock();
        state.persisting = false;
        state.persistent.unpersist(prefix);
    }
}

fn load(prefix: &str, persistent: &mut PersistentStorage) -> BTreeMap<String, Value> {
    let keys: Vec<String> = (0..persistent.len())
        .filter_map(|i| persistent.key(i))
        .filter(|key| key.starts_with(prefix))
        .collect();

    keys.into_iter()
        .filter_map(|key| {
            let value = persistent.get_item(&key, false)?;
            Some((key, value))
        })
        .collect()
}

/// True when `incoming` only refreshes the expirations of `existing` by a
/// negligible amount.
fn is_expiry_refresh(existing: &Value, incoming: &Value, tolerance: f64, now: i64) -> bool {
    let (Some(old), Some(new)) = (expirations(existing), expirations(incoming)) else {
        return false;
    };

    existing.get("value") == incoming.get("value")
        && relative_expiration_difference(old.0, new.0, now) < tolerance
        && relative_expiration_difference(old.1, new.1, now) < tolerance
}

/// Reads `(cacheExpires, preloadExpires)` from a stored value.
fn expirations(value: &Value) -> Option<(i64, i64)> {
    let options = value.get("options")?;
    let cache = options.get("cacheExpires")?.as_i64()?;
    let preload = options.get("preloadExpires")?.as_i64()?;
    Some((cache, preload))
}

/// Change of remaining lifetime relative to the new remaining lifetime.
fn relative_expiration_difference(old: i64, new: i64, now: i64) -> f64 {
    if old == new {
        return 0.0;
    }

    let new_remaining = new.saturating_sub(now) as f64;
    if new_remaining <= 0.0 {
        return f64::INFINITY;
    }
    let old_remaining = old.saturating_sub(now) as f64;

    ((new_remaining - old_remaining) / new_remaining).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageMedium, VolatileMedium};
    use serde_json::json;

    const PREFIX: &str = "TESTPREFIX";

    fn hybrid(medium: &VolatileMedium) -> HybridStorage {
        HybridStorage::new(
            PREFIX,
            PersistentStorage::new(Box::new(medium.clone())),
            DEFAULT_FLUSH_INTERVAL,
            0.10,
        )
    }

    fn stored(value: Value, cache_expires: i64, preload_expires: i64) -> Value {
        json!({
            "value": value,
            "options": { "cacheExpires": cache_expires, "preloadExpires": preload_expires }
        })
    }

    #[test]
    fn test_loads_prefixed_keys_only() {
        let mut medium = VolatileMedium::new();
        medium.set_item("TESTPREFIX-default", "\"test-default\"").unwrap();
        medium.set_item("OTHER-key", "\"ignored\"").unwrap();

        let mut storage = hybrid(&medium);
        assert_eq!(
            storage.get_item("TESTPREFIX-default", false),
            Some(json!("test-default"))
        );
        assert!(storage.get_item("OTHER-key", false).is_none());
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_writes_reach_medium_on_flush() {
        let medium = VolatileMedium::new();
        let mut storage = hybrid(&medium);

        storage.set_item("TESTPREFIX-test1", json!("test1"));
        storage.set_item("TESTPREFIX-test2", json!("test2"));
        assert!(medium.get_item("TESTPREFIX-test1").is_none());
        assert_eq!(storage.pending(), 2);

        assert_eq!(storage.flush(), 2);
        assert_eq!(medium.get_item("TESTPREFIX-test1").as_deref(), Some("\"test1\""));
        assert_eq!(storage.pending(), 0);
    }

    #[test]
    fn test_removals_reach_medium_on_flush() {
        let mut medium = VolatileMedium::new();
        medium.set_item("TESTPREFIX-test1", "\"test1\"").unwrap();
        medium.set_item("TESTPREFIX-test3", "\"test3\"").unwrap();
        let mut storage = hybrid(&medium);

        storage.remove_item("TESTPREFIX-test1");
        assert!(storage.get_item("TESTPREFIX-test1", false).is_none());
        storage.flush();

        assert!(medium.get_item("TESTPREFIX-test1").is_none());
        assert!(medium.get_item("TESTPREFIX-test3").is_some());
    }

    #[test]
    fn test_identical_value_is_not_queued() {
        let medium = VolatileMedium::new();
        let mut storage = hybrid(&medium);

        storage.set_item("TESTPREFIX-a", json!({"x": [1, 2]}));
        storage.flush();
        storage.set_item("TESTPREFIX-a", json!({"x": [1, 2]}));

        assert_eq!(storage.pending(), 0);
        assert_eq!(medium.write_count("TESTPREFIX-a"), 1);
    }

    #[test]
    fn test_small_expiry_refresh_is_suppressed() {
        let medium = VolatileMedium::new();
        let mut storage = hybrid(&medium);
        let now = current_timestamp_ms();
        let hour = 3_600_000;

        storage.set_item("TESTPREFIX-a", stored(json!("same"), now + hour, now + 2 * hour));
        storage.flush();

        storage.set_item(
            "TESTPREFIX-a",
            stored(json!("same"), now + hour + 60_000, now + 2 * hour + 60_000),
        );
        assert_eq!(storage.pending(), 0);

        // Older expirations are kept in memory
        let kept = storage.get_item("TESTPREFIX-a", false).unwrap();
        assert_eq!(kept["options"]["cacheExpires"], json!(now + hour));
    }

    #[test]
    fn test_large_expiry_refresh_is_written() {
        let medium = VolatileMedium::new();
        let mut storage = hybrid(&medium);
        let now = current_timestamp_ms();
        let hour = 3_600_000;

        storage.set_item("TESTPREFIX-a", stored(json!("same"), now + hour, now + hour));
        storage.flush();
        storage.set_item("TESTPREFIX-a", stored(json!("same"), now + 2 * hour, now + 2 * hour));
        storage.flush();

        assert_eq!(medium.write_count("TESTPREFIX-a"), 2);
    }

    #[test]
    fn test_changed_payload_is_written() {
        let medium = VolatileMedium::new();
        let mut storage = hybrid(&medium);
        let now = current_timestamp_ms();

        storage.set_item("TESTPREFIX-a", stored(json!(1), now + 1000, now + 1000));
        storage.set_item("TESTPREFIX-a", stored(json!(2), now + 1000, now + 1000));
        storage.flush();

        assert_eq!(medium.write_count("TESTPREFIX-a"), 1);
        let persisted = medium.get_item("TESTPREFIX-a").unwrap();
        assert!(persisted.contains("value:2"));
    }

    #[test]
    fn test_rejected_write_stays_pending() {
        let medium = VolatileMedium::with_quota(100);
        let mut storage = hybrid(&medium);

        storage.set_item("TESTPREFIX-big", json!("x".repeat(200)));
        assert_eq!(storage.flush(), 0);
        assert!(medium.get_item("TESTPREFIX-big").is_none());
        assert_eq!(storage.pending(), 1);

        medium.set_quota(None);
        assert_eq!(storage.flush(), 1);
        assert!(medium.get_item("TESTPREFIX-big").is_some());
        assert_eq!(storage.pending(), 0);
    }

    #[test]
    fn test_null_transitions() {
        let medium = VolatileMedium::new();
        let mut storage = hybrid(&medium);

        storage.set_item("TESTPREFIX-n", Value::Null);
        assert_eq!(storage.pending(), 0);

        storage.set_item("TESTPREFIX-n", json!(1));
        storage.flush();
        storage.set_item("TESTPREFIX-n", Value::Null);
        assert_eq!(storage.pending(), 1);
        assert!(storage.get_item("TESTPREFIX-n", false).is_none());
    }

    #[test]
    fn test_unpersist_accumulates_until_persist() {
        let mut medium = VolatileMedium::new();
        medium.set_item("TESTPREFIX-old", "1").unwrap();
        let mut storage = hybrid(&medium);

        storage.unpersist(PREFIX);
        assert!(medium.get_item("TESTPREFIX-old").is_none());

        storage.set_item("TESTPREFIX-new", json!(2));
        assert_eq!(storage.flush(), 0);
        assert!(medium.get_item("TESTPREFIX-new").is_none());

        storage.persist();
        assert_eq!(medium.get_item("TESTPREFIX-new").as_deref(), Some("2"));
        assert_eq!(medium.get_item("TESTPREFIX-old").as_deref(), Some("1"));
    }

    #[test]
    fn test_clear_queues_removals() {
        let mut medium = VolatileMedium::new();
        medium.set_item("TESTPREFIX-a", "1").unwrap();
        let mut storage = hybrid(&medium);

        storage.clear();
        assert!(storage.is_empty());
        storage.flush();
        assert!(medium.get_item("TESTPREFIX-a").is_none());
    }

    #[test]
    fn test_relative_difference() {
        let now = 1_000_000;
        assert_eq!(relative_expiration_difference(5, 5, now), 0.0);
        assert!(relative_expiration_difference(now + 1000, now + 1050, now) < 0.10);
        assert!(relative_expiration_difference(now + 1000, now + 2000, now) >= 0.10);
        assert!(relative_expiration_difference(now + 1000, now - 1, now).is_infinite());
        assert_eq!(relative_expiration_difference(i64::MAX, i64::MAX, now), 0.0);
    }
}

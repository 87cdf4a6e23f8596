//! Persistent Backend
//!
//! Stores compacted JSON text on a [`StorageMedium`]. Availability is probed
//! with a throwaway write and the answer is cached for a short while.

use serde_json::Value;
use tracing::{debug, warn};

use super::serialize::{deserialize, serialize};
use super::{StorageBackend, StorageKind, StorageMedium};
use crate::cache::current_timestamp_ms;

/// How long an availability probe result stays valid, in milliseconds.
const ENABLED_CHECK_TTL_MS: i64 = 10_000;

const PROBE_KEY: &str = "__entity_cache_probe__";

pub struct PersistentStorage {
    medium: Box<dyn StorageMedium>,
    enabled: Option<bool>,
    checked_until: i64,
}

impl PersistentStorage {
    pub fn new(medium: Box<dyn StorageMedium>) -> Self {
        Self {
            medium,
            enabled: None,
            checked_until: 0,
        }
    }

    fn probe(&mut self) -> bool {
        self.medium
            .set_item(PROBE_KEY, PROBE_KEY)
            .and_then(|_| self.medium.remove_item(PROBE_KEY))
            .is_ok()
    }
}

impl StorageBackend for PersistentStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Persistent
    }

    fn is_enabled(&mut self, recheck: bool) -> bool {
        if recheck {
            self.enabled = None;
        }

        let now = current_timestamp_ms();
        match self.enabled {
            Some(enabled) if now < self.checked_until => enabled,
            _ => {
                let enabled = self.probe();
                if !enabled {
                    debug!("Persistent medium rejected the availability probe");
                }
                self.enabled = Some(enabled);
                self.checked_until = now + ENABLED_CHECK_TTL_MS;
                enabled
            }
        }
    }

    fn get_item(&mut self, key: &str, force: bool) -> Option<Value> {
        if !force && !self.is_enabled(false) {
            return None;
        }

        let text = self.medium.get_item(key)?;
        match deserialize::<Value>(&text) {
            Ok(value) if !value.is_null() => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring undecodable entry {}: {}", key, e);
                None
            }
        }
    }

    fn set_item(&mut self, key: &str, value: Value) -> Option<usize> {
        if !self.is_enabled(false) {
            return None;
        }

        let item = match serialize(&value) {
            Ok(item) => item,
            Err(e) => {
                warn!("Could not encode {}: {}", key, e);
                return None;
            }
        };

        match self.medium.set_item(key, &item) {
            Ok(()) => Some(item.len()),
            Err(e) => {
                warn!("Write of {} failed: {}", key, e);
                self.is_enabled(true);
                None
            }
        }
    }

    fn remove_item(&mut self, key: &str) {
        if let Err(e) = self.medium.remove_item(key) {
            debug!("Remove of {} failed: {}", key, e);
        }
    }

    fn clear(&mut self) {
        if let Err(e) = self.medium.clear() {
            debug!("Clearing persistent medium failed: {}", e);
        }
    }

    fn len(&self) -> usize {
        self.medium.len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.medium.key(index)
    }

    fn unpersist(&mut self, prefix: &str) {
        let keys: Vec<String> = (0..self.medium.len())
            .filter_map(|i| self.medium.key(i))
            .filter(|key| key.starts_with(prefix))
            .collect();

        debug!("Unpersisting {} keys under {}", keys.len(), prefix);
        for key in keys {
            self.remove_item(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VolatileMedium;
    use serde_json::json;

    #[test]
    fn test_values_are_stored_compacted() {
        let medium = VolatileMedium::new();
        let mut storage = PersistentStorage::new(Box::new(medium.clone()));

        let footprint = storage.set_item("k", json!({"zeros": [0, 0, 0, 0]})).unwrap();
        let raw = medium.get_item("k").unwrap();

        assert_eq!(raw, "{zeros:[0(4)]}");
        assert_eq!(footprint, raw.len());
        assert_eq!(storage.get_item("k", false), Some(json!({"zeros": [0, 0, 0, 0]})));
    }

    #[test]
    fn test_full_medium_reports_disabled() {
        let medium = VolatileMedium::with_quota(0);
        let mut storage = PersistentStorage::new(Box::new(medium));

        assert!(!storage.is_enabled(false));
        assert!(storage.set_item("k", json!(1)).is_none());
    }

    #[test]
    fn test_failed_write_rechecks_availability() {
        let medium = VolatileMedium::with_quota(64);
        let mut storage = PersistentStorage::new(Box::new(medium.clone()));
        assert!(storage.is_enabled(false));

        let big = json!("x".repeat(100));
        assert!(storage.set_item("big", big).is_none());

        // Probe still fits, so the backend stays usable for small values
        assert!(storage.is_enabled(false));
        assert!(storage.set_item("small", json!(1)).is_some());
    }

    #[test]
    fn test_force_read_while_disabled() {
        let mut medium = VolatileMedium::new();
        medium.set_item("k", "[1,2]").unwrap();
        medium.set_quota(Some(0));
        let mut storage = PersistentStorage::new(Box::new(medium));

        assert!(storage.get_item("k", false).is_none());
        assert_eq!(storage.get_item("k", true), Some(json!([1, 2])));
    }

    #[test]
    fn test_undecodable_entry_is_absent() {
        let mut medium = VolatileMedium::new();
        medium.set_item("bad", "[0(oops)]").unwrap();
        let mut storage = PersistentStorage::new(Box::new(medium));

        assert!(storage.get_item("bad", false).is_none());
    }

    #[test]
    fn test_unpersist_clears_prefix_only() {
        let mut medium = VolatileMedium::new();
        medium.set_item("Cache.a", "1").unwrap();
        medium.set_item("Cache.b", "2").unwrap();
        medium.set_item("Other", "3").unwrap();
        let mut storage = PersistentStorage::new(Box::new(medium.clone()));

        storage.unpersist("Cache");

        assert_eq!(medium.len(), 1);
        assert_eq!(medium.get_item("Other").as_deref(), Some("3"));
    }
}

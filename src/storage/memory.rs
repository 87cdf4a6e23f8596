//! In-memory backend. Always enabled, lost with the process.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{StorageBackend, StorageKind};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: BTreeMap<String, Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    fn is_enabled(&mut self, _recheck: bool) -> bool {
        true
    }

    fn get_item(&mut self, key: &str, _force: bool) -> Option<Value> {
        self.data.get(key).filter(|v| !v.is_null()).cloned()
    }

    fn set_item(&mut self, key: &str, value: Value) -> Option<usize> {
        self.data.insert(key.to_string(), value);
        Some(1)
    }

    fn remove_item(&mut self, key: &str) {
        self.data.remove(key);
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.data.keys().nth(index).cloned()
    }
}

//! Tag Index
//!
//! Maps a tag to the storage keys written under it. A key belongs to at most
//! one tag and appears in it once.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagIndex {
    tags: BTreeMap<String, Vec<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `key` to `tag`. Returns false if it was already there.
    pub fn add(&mut self, tag: &str, key: &str) -> bool {
        let keys = self.tags.entry(tag.to_string()).or_default();
        if keys.iter().any(|k| k == key) {
            return false;
        }
        keys.push(key.to_string());
        true
    }

    /// Removes `key` from the first tag that lists it.
    pub fn remove_key(&mut self, key: &str) -> bool {
        for keys in self.tags.values_mut() {
            if let Some(pos) = keys.iter().position(|k| k == key) {
                keys.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drops `tag` and returns the keys it held.
    pub fn take(&mut self, tag: &str) -> Option<Vec<String>> {
        self.tags.remove(tag)
    }

    pub fn keys(&self, tag: &str) -> Option<&[String]> {
        self.tags.get(tag).map(Vec::as_slice)
    }

    /// Every key known to any tag.
    pub fn all_keys(&self) -> impl Iterator<Item = &str> {
        self.tags.values().flatten().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

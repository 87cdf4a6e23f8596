//! Storage Media
//!
//! Raw string key/value surfaces underneath the persistent backend. A medium
//! knows nothing about cache semantics: it stores already-serialized text.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::StorageError;

/// Ordered string key/value surface.
///
/// Enumeration through `len`/`key` follows whatever order the medium keeps;
/// callers only rely on it being stable between two calls without writes.
pub trait StorageMedium: Send {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&mut self, key: &str) -> Result<(), StorageError>;
    fn clear(&mut self) -> Result<(), StorageError>;
    fn len(&self) -> usize;
    fn key(&self, index: usize) -> Option<String>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// == Volatile Medium ==
#[derive(Debug, Default)]
struct VolatileInner {
    items: BTreeMap<String, String>,
    quota: Option<usize>,
    writes: HashMap<String, usize>,
}

impl VolatileInner {
    fn used_bytes(&self) -> usize {
        self.items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// In-memory medium with an optional byte quota.
///
/// Clones share the same underlying items, so a handle kept outside the
/// cache observes everything the cache writes.
#[derive(Debug, Clone, Default)]
pub struct VolatileMedium {
    inner: Arc<Mutex<VolatileInner>>,
}

impl VolatileMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a medium that rejects writes once `bytes` are in use.
    pub fn with_quota(bytes: usize) -> Self {
        let medium = Self::default();
        medium.inner.lock().quota = Some(bytes);
        medium
    }

    /// Changes the quota, `None` lifts it.
    pub fn set_quota(&self, bytes: Option<usize>) {
        self.inner.lock().quota = bytes;
    }

    /// Bytes currently held, counting keys and values.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes()
    }

    /// Number of successful writes ever made to `key`.
    pub fn write_count(&self, key: &str) -> usize {
        self.inner.lock().writes.get(key).copied().unwrap_or(0)
    }
}

impl StorageMedium for VolatileMedium {
    fn get_item(&self, key: &str) -> Option<String> {
        self.inner.lock().items.get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();

        if let Some(quota) = inner.quota {
            let current = inner.items.get(key).map_or(0, |v| key.len() + v.len());
            let used = inner.used_bytes() - current;
            let needed = key.len() + value.len();
            if used + needed > quota {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }

        inner.items.insert(key.to_string(), value.to_string());
        *inner.writes.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().items.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.inner.lock().items.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.inner.lock().items.keys().nth(index).cloned()
    }
}

// == File Medium ==
/// Durable medium keeping one file per key inside a directory.
#[derive(Debug)]
pub struct FileMedium {
    dir: PathBuf,
    keys: BTreeSet<String>,
}

impl FileMedium {
    /// Opens (creating if needed) a directory and indexes the keys already in it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        if dir.is_file() {
            return Err(StorageError::Unavailable(format!(
                "{} is a file, not a directory",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;

        let mut keys = BTreeSet::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(key) = entry.file_name().to_str().and_then(decode_key) {
                keys.insert(key);
            }
        }

        debug!("Opened file medium at {:?} with {} keys", dir, keys.len());
        Ok(Self { dir, keys })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

impl StorageMedium for FileMedium {
    fn get_item(&self, key: &str) -> Option<String> {
        if !self.keys.contains(key) {
            return None;
        }
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::write(self.path_for(key), value)?;
        self.keys.insert(key.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<(), StorageError> {
        self.keys.remove(key);
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        let keys: Vec<String> = self.keys.iter().cloned().collect();
        for key in keys {
            self.remove_item(&key)?;
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.keys.iter().nth(index).cloned()
    }
}

/// Percent-encodes everything outside `[A-Za-z0-9_-]` so any key is a valid file name.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

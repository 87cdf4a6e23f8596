//! Storage Module
//!
//! Backends the cache store writes through: a plain in-memory map, a
//! persistent backend over a [`StorageMedium`], and a hybrid that keeps a
//! working set in memory and flushes it to a persistent backend on a timer.

mod hybrid;
mod medium;
mod memory;
mod persistent;
pub mod serialize;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

pub use hybrid::HybridStorage;
pub(crate) use hybrid::HybridState;
pub use medium::{FileMedium, StorageMedium, VolatileMedium};
pub use memory::MemoryStorage;
pub use persistent::PersistentStorage;

/// Produces a fresh medium for persistent-backed kinds, `None` when no
/// durable medium is available in this host.
pub type MediumProvider = Arc<dyn Fn() -> Option<Box<dyn StorageMedium>> + Send + Sync>;

// == Storage Kind ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Memory,
    Persistent,
    Hybrid,
}

impl StorageKind {
    /// Whether data written through this kind outlives the process.
    pub fn is_durable(self) -> bool {
        !matches!(self, StorageKind::Memory)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageKind::Memory => "memory",
            StorageKind::Persistent => "persistent",
            StorageKind::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "persistent" | "local" => Ok(StorageKind::Persistent),
            "hybrid" => Ok(StorageKind::Hybrid),
            other => Err(format!("unknown storage kind: {}", other)),
        }
    }
}

// == Storage Backend ==
/// Uniform capability every backend variant exposes to the cache store.
pub trait StorageBackend: Send {
    fn kind(&self) -> StorageKind;

    /// Whether the backend accepts writes. `recheck` discards any cached answer.
    fn is_enabled(&mut self, recheck: bool) -> bool;

    /// Reads a value. `force` reads even while the backend reports disabled.
    fn get_item(&mut self, key: &str, force: bool) -> Option<Value>;

    /// Writes a value, returning its footprint or `None` when the write failed.
    fn set_item(&mut self, key: &str, value: Value) -> Option<usize>;

    fn remove_item(&mut self, key: &str);
    fn clear(&mut self);
    fn len(&self) -> usize;
    fn key(&self, index: usize) -> Option<String>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resumes writing through to durable storage.
    fn persist(&mut self) {}

    /// Stops writing through to durable storage and clears keys under `prefix`.
    fn unpersist(&mut self, _prefix: &str) {}
}

// == Backend ==
/// Tagged union of the backend variants.
pub enum Backend {
    Memory(MemoryStorage),
    Persistent(PersistentStorage),
    Hybrid(HybridStorage),
}

macro_rules! dispatch {
    ($self:expr, $backend:ident => $call:expr) => {
        match $self {
            Backend::Memory($backend) => $call,
            Backend::Persistent($backend) => $call,
            Backend::Hybrid($backend) => $call,
        }
    };
}

/// Inputs needed to build any backend variant.
#[derive(Clone)]
pub struct BackendContext {
    pub prefix: String,
    pub medium: MediumProvider,
    pub flush_interval: Duration,
    pub expiry_tolerance: f64,
}

impl Backend {
    /// Builds a backend of the given kind, `None` when it cannot exist here.
    pub fn build(kind: StorageKind, ctx: &BackendContext) -> Option<Self> {
        match kind {
            StorageKind::Memory => Some(Backend::Memory(MemoryStorage::new())),
            StorageKind::Persistent => {
                let medium = (ctx.medium)()?;
                Some(Backend::Persistent(PersistentStorage::new(medium)))
            }
            StorageKind::Hybrid => {
                let medium = (ctx.medium)()?;
                Some(Backend::Hybrid(HybridStorage::new(
                    &ctx.prefix,
                    PersistentStorage::new(medium),
                    ctx.flush_interval,
                    ctx.expiry_tolerance,
                )))
            }
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend({})", self.kind())
    }
}

impl StorageBackend for Backend {
    fn kind(&self) -> StorageKind {
        dispatch!(self, b => b.kind())
    }

    fn is_enabled(&mut self, recheck: bool) -> bool {
        dispatch!(self, b => b.is_enabled(recheck))
    }

    fn get_item(&mut self, key: &str, force: bool) -> Option<Value> {
        dispatch!(self, b => b.get_item(key, force))
    }

    fn set_item(&mut self, key: &str, value: Value) -> Option<usize> {
        dispatch!(self, b => b.set_item(key, value))
    }

    fn remove_item(&mut self, key: &str) {
        dispatch!(self, b => b.remove_item(key))
    }

    fn clear(&mut self) {
        dispatch!(self, b => b.clear())
    }

    fn len(&self) -> usize {
        dispatch!(self, b => b.len())
    }

    fn key(&self, index: usize) -> Option<String> {
        dispatch!(self, b => b.key(index))
    }

    fn persist(&mut self) {
        dispatch!(self, b => b.persist())
    }

    fn unpersist(&mut self, prefix: &str) {
        dispatch!(self, b => b.unpersist(prefix))
    }
}

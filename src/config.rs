//! Configuration Module
//!
//! Handles loading and managing cache store configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::storage::StorageKind;

// == Defaults ==
pub const DEFAULT_KEY_PREFIX: &str = "CacheService";
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_EXPIRY_TOLERANCE: f64 = 0.10;
pub const DEFAULT_OVERSIZED_THRESHOLD: usize = 1000;
pub const DEFAULT_SWEEP_DELAY_SECS: u64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 600;

// == Host Context ==
/// Lifetime of the process hosting the cache.
///
/// A long-lived host (an interactive client) expects a durable backend,
/// a short-lived host (a request-scoped server render) expects memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostContext {
    #[default]
    LongLived,
    ShortLived,
}

impl FromStr for HostContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long-lived" | "long_lived" | "client" => Ok(HostContext::LongLived),
            "short-lived" | "short_lived" | "server" => Ok(HostContext::ShortLived),
            other => Err(format!("unknown host context: {}", other)),
        }
    }
}

/// Cache store configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Desired backend kinds, most preferred first
    pub storages: Vec<StorageKind>,
    /// Prefix prepended to every storage key
    pub key_prefix: String,
    /// Kind of process hosting the cache
    pub host: HostContext,
    /// Directory for the durable file medium, if any
    pub persist_dir: Option<PathBuf>,
    /// Hybrid backend flush interval in milliseconds
    pub flush_interval_ms: u64,
    /// Relative expiry change below which hybrid writes are suppressed
    pub expiry_tolerance: f64,
    /// Serialized size above which non-expiring values are tracked for eviction
    pub oversized_threshold: usize,
    /// Delay before the first expiration sweep, in seconds
    pub sweep_delay_secs: u64,
    /// Interval between expiration sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl StoreConfig {
    /// Creates a new StoreConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_STORAGES` - Comma-separated backend kinds (default: memory)
    /// - `CACHE_KEY_PREFIX` - Storage key prefix (default: CacheService)
    /// - `CACHE_HOST` - `long-lived` or `short-lived` (default: long-lived)
    /// - `CACHE_DIR` - Directory for durable storage (default: none)
    /// - `CACHE_FLUSH_INTERVAL_MS` - Hybrid flush interval (default: 5000)
    /// - `CACHE_EXPIRY_TOLERANCE` - Hybrid expiry tolerance (default: 0.10)
    /// - `CACHE_OVERSIZED_THRESHOLD` - Oversized value threshold (default: 1000)
    /// - `CACHE_SWEEP_DELAY_SECS` - First sweep delay (default: 60)
    /// - `CACHE_SWEEP_INTERVAL_SECS` - Sweep interval (default: 600)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            storages: env::var("CACHE_STORAGES")
                .ok()
                .map(|v| parse_storages(&v))
                .filter(|kinds| !kinds.is_empty())
                .unwrap_or(defaults.storages),
            key_prefix: env::var("CACHE_KEY_PREFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.key_prefix),
            host: env::var("CACHE_HOST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.host),
            persist_dir: env::var("CACHE_DIR").ok().map(PathBuf::from),
            flush_interval_ms: env::var("CACHE_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.flush_interval_ms),
            expiry_tolerance: env::var("CACHE_EXPIRY_TOLERANCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.expiry_tolerance),
            oversized_threshold: env::var("CACHE_OVERSIZED_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.oversized_threshold),
            sweep_delay_secs: env::var("CACHE_SWEEP_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_delay_secs),
            sweep_interval_secs: env::var("CACHE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_interval_secs),
        }
    }

    /// Convenience constructor for an ordered list of backend kinds.
    pub fn with_storages(storages: impl IntoIterator<Item = StorageKind>) -> Self {
        Self {
            storages: storages.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn sweep_delay(&self) -> Duration {
        Duration::from_secs(self.sweep_delay_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storages: vec![StorageKind::Memory],
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            host: HostContext::LongLived,
            persist_dir: None,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            expiry_tolerance: DEFAULT_EXPIRY_TOLERANCE,
            oversized_threshold: DEFAULT_OVERSIZED_THRESHOLD,
            sweep_delay_secs: DEFAULT_SWEEP_DELAY_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

/// Parses `memory,hybrid` style lists, skipping unknown entries.
fn parse_storages(value: &str) -> Vec<StorageKind> {
    value
        .split(',')
        .filter_map(|part| part.parse().ok())
        .collect()
}

//! Logger Capability
//!
//! Advisory sink for structural warnings about backend and host mismatches.

use tracing::error;

/// Receives non-fatal advisory messages from the cache store.
pub trait CacheLogger: Send + Sync {
    fn error(&self, message: &str);
}

/// Default logger that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl CacheLogger for TracingLogger {
    fn error(&self, message: &str) {
        error!(target: "entity_cache", "{}", message);
    }
}

//! Expiration Sweep Task
//!
//! Background task that periodically removes expired tag-indexed entries.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheStore;

/// Spawns a background task that sweeps expired cache entries.
///
/// The first sweep runs after `delay`, later sweeps every `interval`. The
/// task holds the store weakly and exits once the store is dropped.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task.
///
/// # Example
/// ```ignore
/// let handle = spawn_sweep_task(Arc::downgrade(&store), delay, interval);
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_sweep_task(
    store: Weak<CacheStore>,
    delay: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting expiration sweep task, first run in {:?}, then every {:?}",
            delay, interval
        );

        tokio::time::sleep(delay).await;

        loop {
            let removed = match store.upgrade() {
                Some(store) => store.sweep_expired(),
                None => {
                    debug!("Cache store dropped, stopping expiration sweep");
                    break;
                }
            };

            if removed > 0 {
                info!("Expiration sweep: removed {} expired entries", removed);
            } else {
                debug!("Expiration sweep: no expired entries found");
            }

            tokio::time::sleep(interval).await;
        }
    })
}

//! Hybrid Flush Task
//!
//! Background task that periodically writes the hybrid working set back to
//! its persistent backend.

use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::storage::HybridState;

/// Spawns the periodic flush for a hybrid storage.
///
/// The task exits when the storage state has been dropped. Aborting the
/// handle stops it without a final flush.
pub(crate) fn spawn_flush_task(
    state: Weak<Mutex<HybridState>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Starting hybrid flush task with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let Some(state) = state.upgrade() else {
                debug!("Hybrid storage dropped, stopping flush task");
                break;
            };
            let written = state.lock().flush();

            if written > 0 {
                debug!("Hybrid flush task: {} keys written", written);
            }
        }
    })
}

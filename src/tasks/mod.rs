//! Background Tasks Module
//!
//! Periodic tasks spawned on the tokio runtime.
//!
//! # Tasks
//! - Expiration sweep: removes tag-indexed entries past both expirations
//! - Hybrid flush: writes the hybrid working set back to its persistent backend
//!
//! Both hold only a weak reference to what they service and stop on their
//! own once it is dropped.

mod flush;
mod sweep;

pub(crate) use flush::spawn_flush_task;
pub use sweep::spawn_sweep_task;

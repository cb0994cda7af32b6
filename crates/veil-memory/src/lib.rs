//! Memory pressure monitoring for the Veil service.
//!
//! A single [`MemoryMonitor`] samples process RSS as a percentage of total
//! system memory on a fixed interval in a background task. Components that
//! hold reclaimable state (the response cache, detector result caches)
//! register [`FlushTarget`] hooks; when usage crosses the configured
//! thresholds the monitor runs a cleanup pass over them, at emergency
//! severity when the critical threshold is breached. Cleanups honor a
//! minimum interval so pressure spikes cannot thrash the caches.

mod config;
mod guard;
mod monitor;

pub use config::MemoryConfig;
pub use guard::{MemoryTracker, TrackToken};
pub use monitor::{CleanupSeverity, FlushTarget, MemoryMonitor, MemoryStats};

//! Priority-aware synchronization primitives.
//!
//! All locks in the service carry a name (for logs and statistics), a
//! priority, and a default timeout. Global locks participate in hierarchy
//! checking through a shared [`LockManager`]: a task that already holds a
//! lower-priority global lock is refused a higher-priority one, which keeps
//! the process deadlock-free by construction. Held-lock accounting is
//! keyed by logical task context (see [`with_lock_context`]), never by the
//! runtime thread tasks interleave on. Instance locks (one per
//! object, e.g. a PDF extractor's document lock) are tracked separately and
//! exempt from the hierarchy, so per-object locking never contends on
//! process-wide state.
//!
//! No acquisition blocks forever: every path takes a timeout and reports
//! failure as a boolean-style `Option<Guard>` rather than an error.

mod lock;
mod manager;
mod semaphore;
mod stats;

pub use lock::{LockGuard, TimeoutLock};
pub use manager::{with_lock_context, LockManager, LockPriority};
pub use semaphore::{SemaphoreGuard, TimeoutSemaphore};
pub use stats::{LockStatistics, LockStatsSnapshot, PerLockSnapshot};

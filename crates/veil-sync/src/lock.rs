use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::manager::{LockManager, LockPriority};

/// A named mutual-exclusion lock with a priority and a default timeout.
///
/// Acquisition never blocks past its timeout and never panics; a timed-out
/// or hierarchy-refused attempt yields `None`. The returned [`LockGuard`]
/// releases on every exit path.
pub struct TimeoutLock {
    name: String,
    priority: LockPriority,
    is_instance_lock: bool,
    default_timeout: Duration,
    sem: Arc<Semaphore>,
    manager: Arc<LockManager>,
}

impl TimeoutLock {
    pub fn new(
        name: impl Into<String>,
        priority: LockPriority,
        default_timeout: Duration,
        manager: Arc<LockManager>,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            is_instance_lock: false,
            default_timeout,
            sem: Arc::new(Semaphore::new(1)),
            manager,
        }
    }

    /// An instance lock: owned by one object, exempt from hierarchy checks.
    pub fn new_instance(
        name: impl Into<String>,
        priority: LockPriority,
        default_timeout: Duration,
        manager: Arc<LockManager>,
    ) -> Self {
        Self {
            is_instance_lock: true,
            ..Self::new(name, priority, default_timeout, manager)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> LockPriority {
        self.priority
    }

    pub fn is_instance_lock(&self) -> bool {
        self.is_instance_lock
    }

    /// Acquires with the given timeout (default when `None`). Returns the
    /// guard on success; `None` on timeout or hierarchy refusal.
    pub async fn acquire(&self, timeout_override: Option<Duration>) -> Option<LockGuard> {
        let wait_budget = timeout_override.unwrap_or(self.default_timeout);
        let stats = self.manager.statistics().clone();

        if !self.is_instance_lock && self.manager.would_invert(&self.name, self.priority) {
            stats.record_timeout(&self.name);
            return None;
        }

        let contended = self.sem.available_permits() == 0;
        let started = Instant::now();
        let permit = match timeout(wait_budget, self.sem.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                // Semaphore closed; treated as a timeout, never a panic.
                stats.record_timeout(&self.name);
                return None;
            }
            Err(_) => {
                warn!(
                    lock = %self.name,
                    timeout_ms = wait_budget.as_millis() as u64,
                    "Lock acquisition timed out"
                );
                stats.record_timeout(&self.name);
                return None;
            }
        };

        let waited = started.elapsed();
        stats.record_acquired(&self.name, waited, contended);
        debug!(lock = %self.name, wait_us = waited.as_micros() as u64, "Lock acquired");

        let registration = if self.is_instance_lock {
            None
        } else {
            Some(self.manager.register(&self.name, self.priority))
        };

        Some(LockGuard {
            _permit: permit,
            name: self.name.clone(),
            registration,
            manager: self.manager.clone(),
        })
    }

    /// Scoped acquire-with-default-timeout; mirrors `acquire(None)`.
    pub async fn acquire_default(&self) -> Option<LockGuard> {
        self.acquire(None).await
    }
}

/// RAII guard for a [`TimeoutLock`]; releases and unregisters on drop.
pub struct LockGuard {
    _permit: OwnedSemaphorePermit,
    name: String,
    registration: Option<u64>,
    manager: Arc<LockManager>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(key) = self.registration {
            self.manager.unregister(key, &self.name);
        }
        self.manager.statistics().record_released(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::LockStatistics;

    fn manager() -> Arc<LockManager> {
        LockManager::new(Arc::new(LockStatistics::new()))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let mgr = manager();
        let lock = TimeoutLock::new("test", LockPriority::Medium, Duration::from_secs(1), mgr.clone());

        let guard = lock.acquire(None).await;
        assert!(guard.is_some());
        drop(guard);

        // Lock is free again.
        assert!(lock.acquire(Some(Duration::from_millis(50))).await.is_some());
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let mgr = manager();
        let lock = TimeoutLock::new("busy", LockPriority::Medium, Duration::from_secs(1), mgr.clone());

        let _held = lock.acquire(None).await.unwrap();
        let second = lock.acquire(Some(Duration::from_millis(20))).await;
        assert!(second.is_none());

        let snap = mgr.statistics().snapshot();
        let busy = snap.locks.iter().find(|l| l.name == "busy").unwrap();
        assert_eq!(busy.timeouts, 1);
        assert_eq!(busy.active_holders, 1);
    }

    #[tokio::test]
    async fn test_hierarchy_inversion_refused_as_timeout() {
        let mgr = manager();
        let low = TimeoutLock::new("cache_write", LockPriority::Low, Duration::from_secs(1), mgr.clone());
        let high = TimeoutLock::new("model_init", LockPriority::High, Duration::from_secs(1), mgr.clone());

        let _low_guard = low.acquire(None).await.unwrap();
        // Holding LOW, requesting HIGH must be refused.
        assert!(high.acquire(Some(Duration::from_millis(50))).await.is_none());

        let snap = mgr.statistics().snapshot();
        let init = snap.locks.iter().find(|l| l.name == "model_init").unwrap();
        assert_eq!(init.timeouts, 1);
        assert_eq!(init.acquisitions, 0);
    }

    #[tokio::test]
    async fn test_instance_lock_exempt_from_hierarchy() {
        let mgr = manager();
        let low = TimeoutLock::new("cache_write", LockPriority::Low, Duration::from_secs(1), mgr.clone());
        let instance =
            TimeoutLock::new_instance("doc_lock", LockPriority::High, Duration::from_secs(1), mgr.clone());

        let _low_guard = low.acquire(None).await.unwrap();
        // Instance locks ignore the hierarchy entirely.
        assert!(instance.acquire(Some(Duration::from_millis(50))).await.is_some());
    }

    #[tokio::test]
    async fn test_contexts_do_not_share_holdings_on_one_thread() {
        use crate::manager::with_lock_context;

        let mgr = manager();
        let low = TimeoutLock::new("cache_write", LockPriority::Low, Duration::from_secs(1), mgr.clone());
        let high = TimeoutLock::new("model_init", LockPriority::High, Duration::from_secs(1), mgr.clone());

        // One task context holds the LOW lock...
        let held = with_lock_context(async { low.acquire(None).await })
            .await
            .unwrap();

        // ...an unrelated task context on the same thread is still allowed
        // the HIGH lock: its held-lock set is its own.
        let other = with_lock_context(async { high.acquire(Some(Duration::from_millis(50))).await })
            .await;
        assert!(other.is_some());

        drop(other);
        drop(held);
        assert_eq!(mgr.active_contexts(), 0);
    }

    #[tokio::test]
    async fn test_inversion_refused_within_one_context() {
        use crate::manager::with_lock_context;

        let mgr = manager();
        let low = TimeoutLock::new("cache_write", LockPriority::Low, Duration::from_secs(1), mgr.clone());
        let high = TimeoutLock::new("model_init", LockPriority::High, Duration::from_secs(1), mgr.clone());

        let refused = with_lock_context(async {
            let _held = low.acquire(None).await.unwrap();
            high.acquire(Some(Duration::from_millis(50))).await.is_none()
        })
        .await;
        assert!(refused);
    }

    #[tokio::test]
    async fn test_nested_same_direction_allowed() {
        let mgr = manager();
        let high = TimeoutLock::new("model_init", LockPriority::High, Duration::from_secs(1), mgr.clone());
        let low = TimeoutLock::new("cache_write", LockPriority::Low, Duration::from_secs(1), mgr.clone());

        let _h = high.acquire(None).await.unwrap();
        // High -> Low follows the hierarchy and is allowed.
        assert!(low.acquire(Some(Duration::from_millis(50))).await.is_some());
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Counting semaphore with a name, acquisition timeouts, and an observable
/// remaining-permit count.
///
/// Release saturates at the initial permit count; a stray release is logged
/// and dropped instead of growing the pool.
pub struct TimeoutSemaphore {
    name: String,
    initial: usize,
    outstanding: Arc<AtomicUsize>,
    sem: Arc<Semaphore>,
    default_timeout: Duration,
}

impl TimeoutSemaphore {
    pub fn new(name: impl Into<String>, permits: usize, default_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            initial: permits,
            outstanding: Arc::new(AtomicUsize::new(0)),
            sem: Arc::new(Semaphore::new(permits)),
            default_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Approximate remaining permits, for observability only.
    pub fn current_value(&self) -> usize {
        self.initial
            .saturating_sub(self.outstanding.load(Ordering::Relaxed))
    }

    /// Acquires one permit within the timeout (default when `None`).
    pub async fn acquire(&self, timeout_override: Option<Duration>) -> Option<SemaphoreGuard> {
        let wait_budget = timeout_override.unwrap_or(self.default_timeout);
        let started = Instant::now();
        match timeout(wait_budget, self.sem.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.outstanding.fetch_add(1, Ordering::Relaxed);
                debug!(
                    semaphore = %self.name,
                    wait_us = started.elapsed().as_micros() as u64,
                    remaining = self.current_value(),
                    "Semaphore permit acquired"
                );
                Some(SemaphoreGuard {
                    _permit: permit,
                    outstanding: self.outstanding.clone(),
                })
            }
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(
                    semaphore = %self.name,
                    timeout_ms = wait_budget.as_millis() as u64,
                    "Semaphore acquisition timed out"
                );
                None
            }
        }
    }
}

/// RAII permit for a [`TimeoutSemaphore`].
pub struct SemaphoreGuard {
    _permit: OwnedSemaphorePermit,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

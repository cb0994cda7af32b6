use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::stats::LockStatistics;

/// Lock priority, ordered from most to least urgent.
///
/// The numeric value defines the acquisition hierarchy: while holding a
/// global lock, only locks with an equal or greater numeric value (i.e.
/// same or lower priority) may still be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockPriority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    Background = 4,
}

impl LockPriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

static NEXT_HOLDER_KEY: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static TASK_HOLDER_KEY: u64;
}

thread_local! {
    static THREAD_HOLDER_KEY: Cell<u64> = const { Cell::new(0) };
}

/// Runs `fut` inside a fresh lock-holder context.
///
/// Hierarchy bookkeeping is keyed by logical task, not by the worker
/// thread tasks happen to interleave on: every spawned unit of work that
/// may take global locks must enter its own context, otherwise unrelated
/// tasks sharing a runtime thread would pool their held-lock sets. The
/// request middleware, the parallel executor and the hybrid orchestrator
/// all wrap their futures in this.
pub async fn with_lock_context<F: Future>(fut: F) -> F::Output {
    let key = NEXT_HOLDER_KEY.fetch_add(1, Ordering::Relaxed);
    TASK_HOLDER_KEY.scope(key, fut).await
}

fn current_holder_key() -> u64 {
    // The enclosing task context wins. Outside one (background tasks,
    // spawn_blocking closures) fall back to one key per OS thread; a
    // blocking closure owns its thread for its whole run, so thread
    // identity is exact there.
    TASK_HOLDER_KEY.try_with(|key| *key).unwrap_or_else(|_| {
        THREAD_HOLDER_KEY.with(|cell| {
            let mut key = cell.get();
            if key == 0 {
                key = NEXT_HOLDER_KEY.fetch_add(1, Ordering::Relaxed);
                cell.set(key);
            }
            key
        })
    })
}

#[derive(Debug, Clone)]
struct HeldLock {
    name: String,
    priority: LockPriority,
}

/// Process-wide registry of currently held global locks.
///
/// Keyed by the holder context id (see [`with_lock_context`]). Guards
/// remember the key they registered under, so release stays exact even if
/// a guard is dropped outside the context that acquired it.
pub struct LockManager {
    held: DashMap<u64, Vec<HeldLock>>,
    stats: Arc<LockStatistics>,
}

impl LockManager {
    pub fn new(stats: Arc<LockStatistics>) -> Arc<Self> {
        Arc::new(Self {
            held: DashMap::new(),
            stats,
        })
    }

    pub fn statistics(&self) -> &Arc<LockStatistics> {
        &self.stats
    }

    /// True when acquiring a global lock of `priority` would invert the
    /// hierarchy for the current context. Such attempts are refused and
    /// counted as timeouts by the caller.
    pub fn would_invert(&self, name: &str, priority: LockPriority) -> bool {
        let key = current_holder_key();
        if let Some(held) = self.held.get(&key) {
            for lock in held.iter() {
                if lock.priority.value() > priority.value() {
                    warn!(
                        lock = name,
                        requested = ?priority,
                        held = %lock.name,
                        held_priority = ?lock.priority,
                        "Refusing lock acquisition: would invert priority hierarchy"
                    );
                    return true;
                }
            }
        }
        false
    }

    /// Records a successful global acquisition and returns the registration
    /// key the guard must release with.
    pub(crate) fn register(&self, name: &str, priority: LockPriority) -> u64 {
        let key = current_holder_key();
        self.held.entry(key).or_default().push(HeldLock {
            name: name.to_string(),
            priority,
        });
        key
    }

    pub(crate) fn unregister(&self, key: u64, name: &str) {
        let mut emptied = false;
        if let Some(mut held) = self.held.get_mut(&key) {
            if let Some(pos) = held.iter().rposition(|l| l.name == name) {
                held.remove(pos);
            } else {
                warn!(lock = name, "Releasing a lock that was not registered");
            }
            emptied = held.is_empty();
        }
        if emptied {
            self.held.remove_if(&key, |_, v| v.is_empty());
        }
    }

    /// Number of distinct contexts currently holding at least one global lock.
    pub fn active_contexts(&self) -> usize {
        self.held.len()
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Per-lock counters, updated atomically on every acquisition attempt.
#[derive(Default)]
struct LockCounters {
    acquisitions: AtomicU64,
    wait_time_total_us: AtomicU64,
    wait_time_max_us: AtomicU64,
    timeouts: AtomicU64,
    contentions: AtomicU64,
    active_holders: AtomicU64,
}

/// Process-wide lock usage statistics, exported on `/status`.
pub struct LockStatistics {
    per_lock: DashMap<String, LockCounters>,
}

impl Default for LockStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl LockStatistics {
    pub fn new() -> Self {
        Self {
            per_lock: DashMap::new(),
        }
    }

    pub fn record_acquired(&self, name: &str, waited: Duration, contended: bool) {
        let entry = self.per_lock.entry(name.to_string()).or_default();
        entry.acquisitions.fetch_add(1, Ordering::Relaxed);
        let us = waited.as_micros() as u64;
        entry.wait_time_total_us.fetch_add(us, Ordering::Relaxed);
        entry.wait_time_max_us.fetch_max(us, Ordering::Relaxed);
        if contended {
            entry.contentions.fetch_add(1, Ordering::Relaxed);
        }
        entry.active_holders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self, name: &str) {
        let entry = self.per_lock.entry(name.to_string()).or_default();
        entry.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self, name: &str) {
        if let Some(entry) = self.per_lock.get(name) {
            // Saturate at zero; a stray release must not wrap the gauge.
            let _ = entry
                .active_holders
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    pub fn snapshot(&self) -> LockStatsSnapshot {
        let mut locks: Vec<PerLockSnapshot> = self
            .per_lock
            .iter()
            .map(|entry| {
                let c = entry.value();
                PerLockSnapshot {
                    name: entry.key().clone(),
                    acquisitions: c.acquisitions.load(Ordering::Relaxed),
                    wait_time_total_ms: c.wait_time_total_us.load(Ordering::Relaxed) / 1_000,
                    wait_time_max_ms: c.wait_time_max_us.load(Ordering::Relaxed) / 1_000,
                    timeouts: c.timeouts.load(Ordering::Relaxed),
                    contentions: c.contentions.load(Ordering::Relaxed),
                    active_holders: c.active_holders.load(Ordering::Relaxed),
                }
            })
            .collect();
        locks.sort_by(|a, b| a.name.cmp(&b.name));
        LockStatsSnapshot { locks }
    }
}

/// Serializable view of all lock counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatsSnapshot {
    pub locks: Vec<PerLockSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerLockSnapshot {
    pub name: String,
    pub acquisitions: u64,
    pub wait_time_total_ms: u64,
    pub wait_time_max_ms: u64,
    pub timeouts: u64,
    pub contentions: u64,
    pub active_holders: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_recorded_events() {
        let stats = LockStatistics::new();
        stats.record_acquired("model", Duration::from_millis(5), true);
        stats.record_acquired("model", Duration::from_millis(1), false);
        stats.record_timeout("model");
        stats.record_released("model");

        let snap = stats.snapshot();
        let model = snap.locks.iter().find(|l| l.name == "model").unwrap();
        assert_eq!(model.acquisitions, 2);
        assert_eq!(model.timeouts, 1);
        assert_eq!(model.contentions, 1);
        assert_eq!(model.active_holders, 1);
        assert!(model.wait_time_max_ms >= model.wait_time_total_ms / 2);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let stats = LockStatistics::new();
        stats.record_acquired("x", Duration::ZERO, false);
        stats.record_released("x");
        stats.record_released("x");
        let snap = stats.snapshot();
        assert_eq!(snap.locks[0].active_holders, 0);
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::monitor::{CleanupSeverity, MemoryMonitor};

const HISTORY_LEN: usize = 20;
const DEFAULT_DELTA_THRESHOLD_MB: f64 = 100.0;

/// Tracks per-operation memory growth and triggers cleanup when an
/// operation's increase exceeds an adaptive threshold derived from its own
/// history.
pub struct MemoryTracker {
    monitor: Arc<MemoryMonitor>,
    history: DashMap<String, VecDeque<f64>>,
}

/// Token carrying the pre-operation sample; closed by
/// [`MemoryTracker::finish`].
pub struct TrackToken {
    label: String,
    rss_before_mb: u64,
}

impl MemoryTracker {
    pub fn new(monitor: Arc<MemoryMonitor>) -> Self {
        Self {
            monitor,
            history: DashMap::new(),
        }
    }

    pub fn begin(&self, label: impl Into<String>) -> TrackToken {
        let label = label.into();
        let (_, rss_before_mb) = self.monitor.sample_now();
        TrackToken {
            label,
            rss_before_mb,
        }
    }

    /// Records the operation's memory delta. When the delta exceeds the
    /// adaptive threshold for that label, runs a cleanup whose severity
    /// follows the current overall usage.
    pub async fn finish(&self, token: TrackToken) {
        let (usage_percent, rss_after_mb) = self.monitor.sample_now();
        let delta_mb = rss_after_mb.saturating_sub(token.rss_before_mb) as f64;

        let threshold = {
            let mut entry = self.history.entry(token.label.clone()).or_default();
            let threshold = adaptive_threshold(&entry);
            entry.push_back(delta_mb);
            if entry.len() > HISTORY_LEN {
                entry.pop_front();
            }
            threshold
        };

        debug!(
            operation = %token.label,
            delta_mb = delta_mb,
            threshold_mb = threshold,
            "Operation memory delta recorded"
        );

        if delta_mb > threshold {
            let severity = if usage_percent >= 90.0 {
                CleanupSeverity::Emergency
            } else {
                CleanupSeverity::Regular
            };
            warn!(
                operation = %token.label,
                delta_mb = delta_mb,
                threshold_mb = threshold,
                severity = ?severity,
                "Operation exceeded its memory budget, running cleanup"
            );
            self.monitor.force_cleanup(severity).await;
        }
    }
}

/// Mean of the label's history plus one standard deviation, floored at the
/// default budget so the first runs never trigger.
fn adaptive_threshold(history: &VecDeque<f64>) -> f64 {
    if history.len() < 3 {
        return DEFAULT_DELTA_THRESHOLD_MB;
    }
    let mean = history.iter().sum::<f64>() / history.len() as f64;
    let variance =
        history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / history.len() as f64;
    (mean + variance.sqrt()).max(DEFAULT_DELTA_THRESHOLD_MB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_threshold_floors_at_default() {
        let mut history = VecDeque::new();
        assert_eq!(adaptive_threshold(&history), DEFAULT_DELTA_THRESHOLD_MB);

        history.extend([1.0, 2.0, 1.5]);
        assert_eq!(adaptive_threshold(&history), DEFAULT_DELTA_THRESHOLD_MB);
    }

    #[test]
    fn test_adaptive_threshold_tracks_heavy_history() {
        let history: VecDeque<f64> = [200.0, 220.0, 210.0, 230.0].into_iter().collect();
        let threshold = adaptive_threshold(&history);
        assert!(threshold > 200.0);
        assert!(threshold < 300.0);
    }
}

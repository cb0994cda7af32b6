use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;

/// How aggressively a cleanup pass should reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupSeverity {
    Regular,
    Emergency,
}

/// A component holding reclaimable state (caches, pools). Registered with
/// the monitor and flushed on pressure.
pub trait FlushTarget: Send + Sync {
    fn name(&self) -> &str;
    /// Drops reclaimable state. Emergency severity must drop everything.
    fn flush(&self, severity: CleanupSeverity);
}

/// Rolling memory usage statistics published by the monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Process RSS as a percentage of total system memory.
    pub current_usage: f64,
    pub peak_usage: f64,
    pub average_usage: f64,
    pub checks_count: u64,
    pub available_memory_mb: u64,
    pub rss_mb: u64,
    pub memory_threshold: f64,
    pub critical_threshold: f64,
    pub system_threshold_adjustments: u64,
    pub regular_cleanups: u64,
    pub emergency_cleanups: u64,
}

struct Sampler {
    system: System,
    pid: Pid,
}

impl Sampler {
    fn new() -> Self {
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| Pid::from_u32(std::process::id()));
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Returns (usage percent, rss MB, available MB).
    fn sample(&mut self) -> (f64, u64, u64) {
        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let total = self.system.total_memory();
        let available = self.system.available_memory();
        let rss = self
            .system
            .process(self.pid)
            .map(|p| p.memory())
            .unwrap_or(0);
        let percent = if total > 0 {
            (rss as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (percent, rss / (1024 * 1024), available / (1024 * 1024))
    }

    fn system_usage_percent(&mut self) -> (f64, u64) {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let percent = if total > 0 {
            (used as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        (percent, total / (1024 * 1024 * 1024))
    }
}

/// Background memory monitor. One per process, owned by the application
/// context; components get it as an `Arc`.
pub struct MemoryMonitor {
    config: RwLock<MemoryConfig>,
    sampler: StdMutex<Sampler>,
    usage_bits: AtomicU64,
    stats_tx: watch::Sender<MemoryStats>,
    stats_rx: watch::Receiver<MemoryStats>,
    flush_targets: RwLock<Vec<Arc<dyn FlushTarget>>>,
    shutdown_tx: StdMutex<Option<mpsc::Sender<()>>>,
}

impl MemoryMonitor {
    /// Builds the monitor and, when enabled, starts its sampling task.
    pub fn start(config: MemoryConfig) -> Arc<Self> {
        let (stats_tx, stats_rx) = watch::channel(MemoryStats {
            memory_threshold: config.memory_threshold,
            critical_threshold: config.critical_threshold,
            ..MemoryStats::default()
        });
        let enabled = config.enabled;
        let monitor = Arc::new(Self {
            config: RwLock::new(config),
            sampler: StdMutex::new(Sampler::new()),
            usage_bits: AtomicU64::new(0f64.to_bits()),
            stats_tx,
            stats_rx,
            flush_targets: RwLock::new(Vec::new()),
            shutdown_tx: StdMutex::new(None),
        });

        if enabled {
            let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
            *monitor.shutdown_tx.lock().expect("shutdown mutex poisoned") = Some(shutdown_tx);
            let worker = monitor.clone();
            tokio::spawn(async move {
                let period = worker.config.read().await.check_interval;
                let mut ticker = interval(period);
                let mut last_cleanup: Option<Instant> = None;
                info!(period_secs = period.as_secs(), "Memory monitor started");
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            worker.run_check(&mut last_cleanup).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Memory monitor shutting down");
                            break;
                        }
                    }
                }
            });
        }

        monitor
    }

    pub async fn register_flush_target(&self, target: Arc<dyn FlushTarget>) {
        self.flush_targets.write().await.push(target);
    }

    /// Latest sampled usage percentage; cheap enough for hot paths.
    pub fn usage_percent(&self) -> f64 {
        f64::from_bits(self.usage_bits.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats_rx.borrow().clone()
    }

    /// Refreshes and returns (usage percent, rss MB) immediately, outside
    /// the sampling cadence. Used by per-operation tracking.
    pub fn sample_now(&self) -> (f64, u64) {
        let (percent, rss_mb, _) = self.sampler.lock().expect("sampler mutex poisoned").sample();
        self.usage_bits.store(percent.to_bits(), Ordering::Relaxed);
        (percent, rss_mb)
    }

    /// Worker-sizing factor in (0, 1]: 1.0 below the batch threshold,
    /// shrinking linearly to 0.25 at the critical threshold.
    pub async fn pressure_factor(&self) -> f64 {
        let config = self.config.read().await;
        let usage = self.usage_percent();
        if usage < config.batch_memory_threshold {
            return 1.0;
        }
        let span = (config.critical_threshold - config.batch_memory_threshold).max(1.0);
        let over = (usage - config.batch_memory_threshold).min(span);
        (1.0 - 0.75 * (over / span)).max(0.25)
    }

    /// True when batch scheduling should back off.
    pub async fn over_batch_threshold(&self) -> bool {
        let threshold = self.config.read().await.batch_memory_threshold;
        self.usage_percent() >= threshold
    }

    /// Runs a cleanup pass over all registered targets, unconditionally.
    pub async fn force_cleanup(&self, severity: CleanupSeverity) {
        let targets = self.flush_targets.read().await;
        for target in targets.iter() {
            target.flush(severity);
            debug!(target = target.name(), severity = ?severity, "Flushed cache target");
        }
        self.stats_tx.send_modify(|s| match severity {
            CleanupSeverity::Regular => s.regular_cleanups += 1,
            CleanupSeverity::Emergency => s.emergency_cleanups += 1,
        });
    }

    pub async fn shutdown(&self) {
        let tx = self.shutdown_tx.lock().expect("shutdown mutex poisoned").take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    async fn run_check(&self, last_cleanup: &mut Option<Instant>) {
        let (percent, rss_mb, available_mb) = {
            let mut sampler = self.sampler.lock().expect("sampler mutex poisoned");
            sampler.sample()
        };
        self.usage_bits.store(percent.to_bits(), Ordering::Relaxed);

        let mut checks = 0;
        self.stats_tx.send_modify(|s| {
            s.checks_count += 1;
            checks = s.checks_count;
            s.current_usage = percent;
            s.rss_mb = rss_mb;
            s.available_memory_mb = available_mb;
            if percent > s.peak_usage {
                s.peak_usage = percent;
            }
            // Incremental mean over all samples so far.
            s.average_usage += (percent - s.average_usage) / s.checks_count as f64;
        });

        let config = self.config.read().await.clone();
        if config.adaptive_thresholds && checks % 60 == 0 {
            self.adapt_thresholds().await;
        }

        let severity = if percent >= config.critical_threshold {
            error!(
                usage = percent,
                threshold = config.critical_threshold,
                "Memory usage over critical threshold, running emergency cleanup"
            );
            Some(CleanupSeverity::Emergency)
        } else if percent >= config.memory_threshold {
            warn!(
                usage = percent,
                threshold = config.memory_threshold,
                "Memory usage over threshold, running cleanup"
            );
            Some(CleanupSeverity::Regular)
        } else {
            None
        };

        if let Some(severity) = severity {
            let due = last_cleanup
                .map(|t| t.elapsed() >= config.min_cleanup_interval)
                .unwrap_or(true);
            if due {
                self.force_cleanup(severity).await;
                *last_cleanup = Some(Instant::now());
            } else {
                debug!("Cleanup suppressed by minimum interval");
            }
        }
    }

    /// Recomputes thresholds from the live system: stressed or small
    /// machines get lower thresholds, large idle ones slightly higher.
    async fn adapt_thresholds(&self) {
        let (system_used, total_gb) = {
            let mut sampler = self.sampler.lock().expect("sampler mutex poisoned");
            sampler.system_usage_percent()
        };
        let mut config = self.config.write().await;
        let base: f64 = 80.0;
        let mut threshold = base;
        if total_gb < 4 {
            threshold -= 10.0;
        } else if total_gb >= 16 {
            threshold += 5.0;
        }
        if system_used > 70.0 {
            threshold -= 5.0;
        }
        let threshold = threshold.clamp(60.0, 95.0);
        let critical = (threshold + 10.0).min(98.0);

        if (threshold - config.memory_threshold).abs() > f64::EPSILON {
            info!(
                memory_threshold = threshold,
                critical_threshold = critical,
                system_used = system_used,
                total_gb = total_gb,
                "Adjusted memory thresholds to system conditions"
            );
            config.memory_threshold = threshold;
            config.critical_threshold = critical;
            self.stats_tx.send_modify(|s| {
                s.memory_threshold = threshold;
                s.critical_threshold = critical;
                s.system_threshold_adjustments += 1;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTarget {
        name: String,
        flushes: AtomicUsize,
        emergencies: AtomicUsize,
    }

    impl FlushTarget for CountingTarget {
        fn name(&self) -> &str {
            &self.name
        }
        fn flush(&self, severity: CleanupSeverity) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if severity == CleanupSeverity::Emergency {
                self.emergencies.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn disabled_monitor() -> Arc<MemoryMonitor> {
        MemoryMonitor::start(MemoryConfig {
            enabled: false,
            ..MemoryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_force_cleanup_flushes_targets() {
        let monitor = disabled_monitor();
        let target = Arc::new(CountingTarget {
            name: "cache".into(),
            flushes: AtomicUsize::new(0),
            emergencies: AtomicUsize::new(0),
        });
        monitor.register_flush_target(target.clone()).await;

        monitor.force_cleanup(CleanupSeverity::Regular).await;
        monitor.force_cleanup(CleanupSeverity::Emergency).await;

        assert_eq!(target.flushes.load(Ordering::SeqCst), 2);
        assert_eq!(target.emergencies.load(Ordering::SeqCst), 1);
        let stats = monitor.stats();
        assert_eq!(stats.regular_cleanups, 1);
        assert_eq!(stats.emergency_cleanups, 1);
    }

    #[tokio::test]
    async fn test_pressure_factor_bounds() {
        let monitor = disabled_monitor();

        monitor.usage_bits.store(10f64.to_bits(), Ordering::Relaxed);
        assert_eq!(monitor.pressure_factor().await, 1.0);

        monitor.usage_bits.store(95f64.to_bits(), Ordering::Relaxed);
        let factor = monitor.pressure_factor().await;
        assert!(factor >= 0.25 && factor < 1.0);
    }

    #[tokio::test]
    async fn test_sample_now_populates_usage() {
        let monitor = disabled_monitor();
        let (percent, _rss) = monitor.sample_now();
        assert!(percent >= 0.0);
        assert_eq!(monitor.usage_percent(), percent);
    }
}

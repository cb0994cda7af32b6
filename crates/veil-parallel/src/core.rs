use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use veil_memory::MemoryMonitor;
use veil_sync::with_lock_context;

/// Invoked at most every `progress_interval` with
/// `(completed, total, elapsed)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize, Duration) + Send + Sync>;

/// Per-call options for [`ParallelExecutor::process_in_parallel`].
#[derive(Clone)]
pub struct ParallelOptions {
    /// Pinned worker count; adaptive sizing applies when `None` or when
    /// `adaptive` stays true.
    pub max_workers: Option<usize>,
    pub adaptive: bool,
    pub item_timeout: Duration,
    pub batch_timeout: Duration,
    /// Correlates this batch across log lines.
    pub operation_id: String,
    /// Estimated per-item memory, used to cap workers on small hosts.
    pub memory_per_item_mb: Option<u64>,
    pub progress: Option<ProgressFn>,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_workers: None,
            adaptive: true,
            item_timeout: Duration::from_secs(600),
            batch_timeout: Duration::from_secs(600),
            operation_id: String::new(),
            memory_per_item_mb: None,
            progress: None,
        }
    }
}

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MIN_WORKERS: usize = 2;
const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Default)]
struct ParallelMetrics {
    batches: AtomicU64,
    items: AtomicU64,
    failures: AtomicU64,
    item_timeouts: AtomicU64,
    batch_timeouts: AtomicU64,
}

/// Serializable counters for `/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelMetricsSnapshot {
    pub batches: u64,
    pub items: u64,
    pub failures: u64,
    pub item_timeouts: u64,
    pub batch_timeouts: u64,
}

/// Fan-out executor sized from system conditions.
pub struct ParallelExecutor {
    min_workers: usize,
    max_workers: usize,
    memory: Option<Arc<MemoryMonitor>>,
    metrics: ParallelMetrics,
}

impl ParallelExecutor {
    pub fn new(memory: Option<Arc<MemoryMonitor>>) -> Self {
        Self {
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            memory,
            metrics: ParallelMetrics::default(),
        }
    }

    pub fn with_worker_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers.max(1);
        self.max_workers = max_workers.max(self.min_workers);
        self
    }

    pub fn metrics(&self) -> ParallelMetricsSnapshot {
        ParallelMetricsSnapshot {
            batches: self.metrics.batches.load(Ordering::Relaxed),
            items: self.metrics.items.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            item_timeouts: self.metrics.item_timeouts.load(Ordering::Relaxed),
            batch_timeouts: self.metrics.batch_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Worker count for a batch of `item_count` items.
    ///
    /// A pinned, non-adaptive request uses `min(max_workers, item_count)`.
    /// Otherwise the count starts from the CPU count, shrinks under load
    /// and memory pressure, is capped by the per-item memory estimate, and
    /// clamps to the configured bounds.
    pub async fn optimal_workers(&self, item_count: usize, opts: &ParallelOptions) -> usize {
        if item_count == 0 {
            return 0;
        }
        if let Some(pinned) = opts.max_workers {
            if !opts.adaptive {
                return pinned.clamp(1, item_count.max(1));
            }
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_MIN_WORKERS);
        let mut workers = cpus as f64;

        let load = System::load_average().one;
        if load > 0.0 {
            let load_factor = (cpus as f64 / (load + 1.0)).clamp(0.5, 1.0);
            workers *= load_factor;
        }

        if let Some(monitor) = &self.memory {
            workers *= monitor.pressure_factor().await;

            if let Some(per_item_mb) = opts.memory_per_item_mb {
                let available_mb = monitor.stats().available_memory_mb;
                if per_item_mb > 0 && available_mb > 0 {
                    let by_memory = (available_mb / per_item_mb).max(1) as f64;
                    workers = workers.min(by_memory);
                }
            }
        }

        let upper = opts
            .max_workers
            .unwrap_or(self.max_workers)
            .min(self.max_workers);
        (workers.round() as usize)
            .clamp(self.min_workers, upper.max(self.min_workers))
            .min(item_count)
    }

    /// Runs `f` over all items with bounded concurrency.
    ///
    /// Returns `(index, Option<R>)` for every input index, ordered by
    /// index. Items that fail or exceed `item_timeout` read `None`; a batch
    /// timeout keeps completed results and fills the rest with `None`.
    pub async fn process_in_parallel<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        f: F,
        opts: ParallelOptions,
    ) -> Vec<(usize, Option<R>)>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);
        self.metrics.items.fetch_add(total as u64, Ordering::Relaxed);

        let workers = self.optimal_workers(total, &opts).await;
        info!(
            operation_id = %opts.operation_id,
            items = total,
            workers,
            "Starting parallel batch"
        );

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let results: Arc<Mutex<Vec<Option<R>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let completed = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let item_timeouts = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();
        let last_progress = Arc::new(Mutex::new(started));

        let f = Arc::new(f);
        let mut join_set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let results = results.clone();
            let completed = completed.clone();
            let failures = failures.clone();
            let item_timeouts = item_timeouts.clone();
            let last_progress = last_progress.clone();
            let progress = opts.progress.clone();
            let operation_id = opts.operation_id.clone();
            let item_timeout = opts.item_timeout;
            let f = f.clone();

            // Each item is its own lock-holder context; items must not
            // pool their held-lock sets through a shared worker thread.
            join_set.spawn(with_lock_context(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                match timeout(item_timeout, f(index, item)).await {
                    Ok(Ok(value)) => {
                        let mut slots = results.lock().expect("results mutex poisoned");
                        slots[index] = Some(value);
                    }
                    Ok(Err(error)) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            operation_id = %operation_id,
                            index,
                            error = %error,
                            "Parallel item failed"
                        );
                    }
                    Err(_) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        item_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            operation_id = %operation_id,
                            index,
                            timeout_ms = item_timeout.as_millis() as u64,
                            "Parallel item timed out"
                        );
                    }
                }
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(progress) = progress {
                    let mut last = last_progress.lock().expect("progress mutex poisoned");
                    if last.elapsed() >= PROGRESS_INTERVAL || done == 1 {
                        *last = Instant::now();
                        drop(last);
                        progress(done, total, started.elapsed());
                    }
                }
            }));
        }

        let drained = timeout(opts.batch_timeout, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            self.metrics.batch_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(
                operation_id = %opts.operation_id,
                completed = completed.load(Ordering::Relaxed),
                total,
                timeout_ms = opts.batch_timeout.as_millis() as u64,
                "Batch timed out, returning partial results"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        self.metrics
            .failures
            .fetch_add(failures.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
        self.metrics.item_timeouts.fetch_add(
            item_timeouts.load(Ordering::Relaxed) as u64,
            Ordering::Relaxed,
        );

        debug!(
            operation_id = %opts.operation_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            failures = failures.load(Ordering::Relaxed),
            "Parallel batch finished"
        );

        let slots = Arc::try_unwrap(results)
            .map(|m| m.into_inner().expect("results mutex poisoned"))
            .unwrap_or_else(|arc| {
                // A straggler task still holds a clone after abort; copy out.
                let mut guard = arc.lock().expect("results mutex poisoned");
                std::mem::take(&mut *guard)
            });
        slots.into_iter().enumerate().collect()
    }

    /// Simpler page-level fan-out: local semaphore, per-page timeout, no
    /// batch deadline or adaptive sizing. A failed or timed-out page reads
    /// `None` so the caller can substitute an empty page result.
    pub async fn process_pages_in_parallel<T, R, F, Fut>(
        &self,
        pages: Vec<T>,
        f: F,
        max_workers: Option<usize>,
        page_timeout: Duration,
    ) -> Vec<(usize, Option<R>)>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let opts = ParallelOptions {
            max_workers: Some(max_workers.unwrap_or(self.max_workers)),
            adaptive: false,
            item_timeout: page_timeout,
            // Pages carry their own timeout; the batch deadline only guards
            // against a wedged runtime.
            batch_timeout: page_timeout.saturating_mul(2),
            operation_id: "pages".to_string(),
            memory_per_item_mb: None,
            progress: None,
        };
        self.process_in_parallel(pages, f, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ParallelExecutor {
        ParallelExecutor::new(None)
    }

    #[tokio::test]
    async fn test_results_ordered_and_complete() {
        let out = executor()
            .process_in_parallel(
                vec![10u64, 20, 30, 40],
                |_idx, v| async move { Ok(v * 2) },
                ParallelOptions {
                    max_workers: Some(2),
                    adaptive: false,
                    ..ParallelOptions::default()
                },
            )
            .await;
        assert_eq!(out.len(), 4);
        for (i, (idx, value)) in out.iter().enumerate() {
            assert_eq!(*idx, i);
            assert!(value.is_some());
        }
        assert_eq!(out[3].1, Some(80));
    }

    #[tokio::test]
    async fn test_item_timeout_yields_none_per_item() {
        let out = executor()
            .process_in_parallel(
                vec![(); 5],
                |_idx, _| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
                ParallelOptions {
                    max_workers: Some(5),
                    adaptive: false,
                    item_timeout: Duration::from_millis(100),
                    batch_timeout: Duration::from_secs(5),
                    ..ParallelOptions::default()
                },
            )
            .await;
        let expected: Vec<(usize, Option<()>)> = (0..5).map(|i| (i, None)).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_failed_items_do_not_poison_others() {
        let out = executor()
            .process_in_parallel(
                vec![0u32, 1, 2, 3],
                |_idx, v| async move {
                    if v % 2 == 0 {
                        Ok(v)
                    } else {
                        anyhow::bail!("odd input")
                    }
                },
                ParallelOptions {
                    max_workers: Some(4),
                    adaptive: false,
                    ..ParallelOptions::default()
                },
            )
            .await;
        assert_eq!(out[0].1, Some(0));
        assert_eq!(out[1].1, None);
        assert_eq!(out[2].1, Some(2));
        assert_eq!(out[3].1, None);
    }

    #[tokio::test]
    async fn test_batch_timeout_preserves_completed() {
        let out = executor()
            .process_in_parallel(
                vec![0u64, 1],
                |_idx, v| async move {
                    if v == 0 {
                        Ok(v)
                    } else {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(v)
                    }
                },
                ParallelOptions {
                    max_workers: Some(2),
                    adaptive: false,
                    item_timeout: Duration::from_secs(10),
                    batch_timeout: Duration::from_millis(200),
                    ..ParallelOptions::default()
                },
            )
            .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (0, Some(0)));
        assert_eq!(out[1], (1, None));
    }

    #[tokio::test]
    async fn test_pinned_worker_count_respects_item_count() {
        let ex = executor();
        let opts = ParallelOptions {
            max_workers: Some(16),
            adaptive: false,
            ..ParallelOptions::default()
        };
        assert_eq!(ex.optimal_workers(3, &opts).await, 3);
        assert_eq!(ex.optimal_workers(0, &opts).await, 0);
    }

    #[tokio::test]
    async fn test_adaptive_worker_count_within_bounds() {
        let ex = executor().with_worker_bounds(2, 8);
        let opts = ParallelOptions::default();
        let workers = ex.optimal_workers(100, &opts).await;
        assert!((2..=8).contains(&workers));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let out = executor()
            .process_in_parallel(
                Vec::<u32>::new(),
                |_idx, v| async move { Ok(v) },
                ParallelOptions::default(),
            )
            .await;
        assert!(out.is_empty());
    }
}

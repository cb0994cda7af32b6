use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;
use veil_cache::{CacheConfig, ResponseCache};
use veil_compliance::{RecordKeeper, RecordsConfig};
use veil_detect::{
    EntityDetector, HybridDetector, LlmConfig, LlmDetector, ModelCache, PatternDetector,
    SpanEngineSpec, SpanModelDetector,
};
use veil_memory::{MemoryConfig, MemoryMonitor, MemoryTracker};
use veil_parallel::ParallelExecutor;
use veil_sync::{LockManager, LockPriority, LockStatistics, TimeoutLock, TimeoutSemaphore};

use crate::config::AppConfig;
use crate::errors::ApiError;

/// Everything the handlers share. One instance per process, built by
/// [`AppContext::startup`] and torn down by [`AppContext::shutdown`];
/// nothing here is ambient global state.
pub struct AppContext {
    pub config: AppConfig,
    pub lock_manager: Arc<LockManager>,
    pub lock_stats: Arc<LockStatistics>,
    pub memory: Arc<MemoryMonitor>,
    pub memory_tracker: MemoryTracker,
    pub response_cache: Arc<ResponseCache>,
    /// Gates concurrent PDF work across every endpoint.
    pub pdf_semaphore: Arc<TimeoutSemaphore>,
    pub parallel: Arc<ParallelExecutor>,
    pub model_cache: Arc<ModelCache>,
    pub records: Arc<RecordKeeper>,
    pub pattern: Arc<PatternDetector>,
    pub span: Arc<SpanModelDetector>,
    pub span_no: Arc<SpanModelDetector>,
    pub llm: Arc<LlmDetector>,
    pub hybrid: Arc<HybridDetector>,
    pub started_at: Instant,
}

impl AppContext {
    pub async fn startup(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        let lock_stats = Arc::new(LockStatistics::new());
        let lock_manager = LockManager::new(lock_stats.clone());

        let memory = MemoryMonitor::start(MemoryConfig::from_env());
        let memory_tracker = MemoryTracker::new(memory.clone());

        let response_cache = ResponseCache::new(
            CacheConfig {
                default_ttl: config.cache_ttl,
                ..CacheConfig::default()
            },
            lock_manager.clone(),
        );
        let _sweeper = response_cache.start_sweeper();
        memory.register_flush_target(response_cache.clone()).await;

        let pdf_semaphore = Arc::new(TimeoutSemaphore::new(
            "pdf_operations",
            config.pdf_concurrency,
            Duration::from_secs(60),
        ));

        let parallel = Arc::new(ParallelExecutor::new(Some(memory.clone())));

        let model_cache = ModelCache::new();
        let model_lock = Arc::new(TimeoutLock::new(
            "model_init",
            LockPriority::High,
            Duration::from_secs(600),
            lock_manager.clone(),
        ));

        let span_spec = SpanEngineSpec {
            inference_endpoint: config.inference_endpoint.clone(),
            artifact_base_url: config.artifact_base_url.clone(),
            ..SpanEngineSpec::multi_pii(&config.model_root)
        };
        let span = Arc::new(SpanModelDetector::new(
            span_spec,
            model_cache.clone(),
            model_lock.clone(),
            lock_manager.clone(),
            parallel.clone(),
        ));
        let span_no_spec = SpanEngineSpec {
            inference_endpoint: config.inference_endpoint.clone(),
            artifact_base_url: config.artifact_base_url.clone(),
            ..SpanEngineSpec::norwegian(&config.model_root)
        };
        let span_no = Arc::new(SpanModelDetector::new(
            span_no_spec,
            model_cache.clone(),
            model_lock,
            lock_manager.clone(),
            parallel.clone(),
        ));
        memory.register_flush_target(span.flush_target()).await;
        memory.register_flush_target(span_no.flush_target()).await;

        let pattern = PatternDetector::new();
        let llm = LlmDetector::new(LlmConfig::from_env());

        let hybrid = HybridDetector::new(vec![
            pattern.clone() as Arc<dyn EntityDetector>,
            span.clone() as Arc<dyn EntityDetector>,
            span_no.clone() as Arc<dyn EntityDetector>,
            llm.clone() as Arc<dyn EntityDetector>,
        ]);

        let records = RecordKeeper::new(RecordsConfig {
            records_dir: config.records_dir.clone(),
            retention_days: config.retention_days,
        })
        .await?;
        // Retention is enforced at startup, then daily by the task.
        records.cleanup_expired().await?;
        let _retention = records.start_retention_task();

        info!(
            bind = %config.bind_addr,
            environment = %config.environment,
            "Application context initialized"
        );

        Ok(Arc::new(Self {
            config,
            lock_manager,
            lock_stats,
            memory,
            memory_tracker,
            response_cache,
            pdf_semaphore,
            parallel,
            model_cache,
            records,
            pattern,
            span,
            span_no,
            llm,
            hybrid,
            started_at: Instant::now(),
        }))
    }

    /// Detector behind one of the detection routes.
    pub fn detector_for(&self, engine: &str) -> Result<Arc<dyn EntityDetector>, ApiError> {
        match engine {
            "pattern" => Ok(self.pattern.clone()),
            "span" => Ok(self.span.clone()),
            "span_no" => Ok(self.span_no.clone()),
            "llm" => Ok(self.llm.clone()),
            "hybrid" => Ok(self.hybrid.clone()),
            other => Err(ApiError::validation(format!("unknown engine {other:?}"))),
        }
    }

    pub fn all_detectors(&self) -> Vec<Arc<dyn EntityDetector>> {
        vec![
            self.pattern.clone(),
            self.span.clone(),
            self.span_no.clone(),
            self.llm.clone(),
            self.hybrid.clone(),
        ]
    }

    pub async fn shutdown(&self) {
        self.memory.shutdown().await;
        self.response_cache.clear().await;
        info!("Application context shut down");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;
    use veil_detect::MockSpanModel;

    /// Context with mock span models and temp directories, for router
    /// tests.
    pub async fn test_context() -> Arc<AppContext> {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AppConfig {
            records_dir: dir.path().join("records"),
            model_root: dir.path().join("models"),
            ..AppConfig::default()
        };
        // Leak the TempDir so the paths stay alive for the test process.
        std::mem::forget(dir);

        let context = AppContext::startup(config).await.unwrap();
        let span_model = Arc::new(
            MockSpanModel::new()
                .with_term("John Doe", "PERSON", 0.92)
                .with_term("kari@example.no", "EMAIL", 0.97),
        );
        let span_no_model = Arc::new(
            MockSpanModel::new()
                .with_term("John Doe", "PERSON-H", 0.92)
                .with_term("jeg", "PERSON-H", 0.9),
        );

        // Rebuild the span detectors with injected mock models.
        let span = Arc::new(
            SpanModelDetector::new(
                SpanEngineSpec::multi_pii(&context.config.model_root),
                context.model_cache.clone(),
                Arc::new(TimeoutLock::new(
                    "model_init_test",
                    LockPriority::High,
                    Duration::from_secs(5),
                    context.lock_manager.clone(),
                )),
                context.lock_manager.clone(),
                context.parallel.clone(),
            )
            .with_model(span_model)
            .await,
        );
        let span_no = Arc::new(
            SpanModelDetector::new(
                SpanEngineSpec::norwegian(&context.config.model_root),
                context.model_cache.clone(),
                Arc::new(TimeoutLock::new(
                    "model_init_test_no",
                    LockPriority::High,
                    Duration::from_secs(5),
                    context.lock_manager.clone(),
                )),
                context.lock_manager.clone(),
                context.parallel.clone(),
            )
            .with_model(span_no_model)
            .await,
        );
        let hybrid = HybridDetector::new(vec![
            context.pattern.clone() as Arc<dyn EntityDetector>,
            span.clone() as Arc<dyn EntityDetector>,
            span_no.clone() as Arc<dyn EntityDetector>,
        ]);

        Arc::new(AppContext {
            config: context.config.clone(),
            lock_manager: context.lock_manager.clone(),
            lock_stats: context.lock_stats.clone(),
            memory: context.memory.clone(),
            memory_tracker: MemoryTracker::new(context.memory.clone()),
            response_cache: context.response_cache.clone(),
            pdf_semaphore: context.pdf_semaphore.clone(),
            parallel: context.parallel.clone(),
            model_cache: context.model_cache.clone(),
            records: context.records.clone(),
            pattern: context.pattern.clone(),
            span,
            span_no,
            llm: context.llm.clone(),
            hybrid,
            started_at: Instant::now(),
        })
    }
}

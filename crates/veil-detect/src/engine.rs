//! The generic span-model detector.
//!
//! One detector exists per engine configuration; all of them share the
//! process-wide model cache keyed by initialization parameters. Detection
//! fans out over pages, chunks each page into sentence groups, and runs
//! the model over chunks under the detector's analyzer lock so one engine
//! never issues overlapping inference calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use veil_compliance::{minimize_extracted_data, MinimizationConfig};
use veil_memory::{CleanupSeverity, FlushTarget};
use veil_parallel::{process_entities_in_parallel, ParallelExecutor};
use veil_sync::{LockManager, LockPriority, TimeoutLock};
use veil_types::{
    DetectorStatus, Entity, ExtractedData, PageRedaction, RedactionMapping, Word, WordOffset,
};

use crate::base::{process_single_entity, standardize_raw_span};
use crate::chunking::{chunk_text, MAX_GROUP_CHARS};
use crate::model::{
    fetch_model_artifacts, local_model_exists, CachedModel, ModelCache, ModelKey, RemoteSpanModel,
    SpanModel,
};
use crate::pronouns::filter_pronoun_false_positives;
use crate::EntityDetector;

/// Model prediction threshold used for every chunk.
const PREDICT_THRESHOLD: f64 = 0.40;

/// Per-page budget inside the page fan-out.
const PAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a task waits for a sibling's in-flight initialization.
const SIBLING_INIT_WAIT: Duration = Duration::from_secs(60);

const INIT_RETRIES: usize = 2;
const ENTITY_BATCH_SIZE: usize = 10;

/// Static description of one concrete span-model engine.
#[derive(Debug, Clone)]
pub struct SpanEngineSpec {
    pub engine_name: String,
    pub model_id: String,
    pub default_entities: Vec<String>,
    pub model_dir: PathBuf,
    pub cache_namespace: String,
    /// Recognized configuration file names, first one preferred.
    pub config_file_names: Vec<String>,
    /// Artifact registry to fetch missing models from.
    pub artifact_base_url: Option<String>,
    /// Inference server this engine's predictions run against.
    pub inference_endpoint: Option<String>,
}

impl SpanEngineSpec {
    /// The multilingual PII engine.
    pub fn multi_pii(model_root: &Path) -> Self {
        Self {
            engine_name: "span".to_string(),
            model_id: "veil/span-pii-multi".to_string(),
            default_entities: [
                "PERSON",
                "LOCATION",
                "ORGANISATION",
                "EMAIL",
                "PHONE",
                "NATIONAL_ID",
                "ADDRESS",
                "DATE",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            model_dir: model_root.join("span-pii-multi"),
            cache_namespace: "span".to_string(),
            config_file_names: vec!["span_config.json".to_string(), "config.json".to_string()],
            artifact_base_url: None,
            inference_endpoint: None,
        }
    }

    /// The Norwegian-tuned engine; its person labels are what the pronoun
    /// filter watches for.
    pub fn norwegian(model_root: &Path) -> Self {
        Self {
            engine_name: "span_no".to_string(),
            model_id: "veil/span-pii-no".to_string(),
            default_entities: [
                "PERSON-H",
                "FNR-H",
                "TLF-H",
                "EPOST-H",
                "ADRESSE-H",
                "STED-H",
                "ORG-H",
                "DATO-H",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            model_dir: model_root.join("span-pii-no"),
            cache_namespace: "span_no".to_string(),
            config_file_names: vec!["span_config.json".to_string(), "config.json".to_string()],
            artifact_base_url: None,
            inference_endpoint: None,
        }
    }

    /// Validates a requested entity list against this engine: every label
    /// must be well-formed and one of the engine's defaults. `None` selects
    /// the defaults.
    pub fn validate_requested(
        &self,
        requested: Option<&[String]>,
    ) -> veil_types::Result<Vec<String>> {
        let Some(requested) = requested else {
            return Ok(self.default_entities.clone());
        };
        let mut validated = Vec::with_capacity(requested.len());
        for label in requested {
            let trimmed = label.trim();
            if trimmed.is_empty() || trimmed.len() > 64 {
                return Err(veil_types::VeilError::validation(format!(
                    "invalid entity label: {label:?}"
                )));
            }
            if !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            {
                return Err(veil_types::VeilError::validation(format!(
                    "entity label has unsupported characters: {label:?}"
                )));
            }
            let Some(known) = self
                .default_entities
                .iter()
                .find(|known| known.eq_ignore_ascii_case(trimmed))
            else {
                return Err(veil_types::VeilError::validation(format!(
                    "entity {trimmed:?} is not supported by engine {}",
                    self.engine_name
                )));
            };
            if !validated.contains(known) {
                validated.push(known.clone());
            }
        }
        Ok(validated)
    }
}

struct DetectorCore {
    spec: SpanEngineSpec,
    model_cache: Arc<ModelCache>,
    /// Process-wide HIGH-priority lock guarding model cache mutation.
    model_lock: Arc<TimeoutLock>,
    /// Per-detector HIGH-priority lock serializing inference calls.
    analyzer_lock: TimeoutLock,
    result_cache: DashMap<String, Vec<Entity>>,
    status: Mutex<DetectorStatus>,
    model: RwLock<Option<Arc<dyn SpanModel>>>,
    initializing: AtomicBool,
    init_failed: AtomicBool,
    http: reqwest::Client,
}

/// A singleton detection engine backed by a span model.
pub struct SpanModelDetector {
    core: Arc<DetectorCore>,
    parallel: Arc<ParallelExecutor>,
}

impl SpanModelDetector {
    pub fn new(
        spec: SpanEngineSpec,
        model_cache: Arc<ModelCache>,
        model_lock: Arc<TimeoutLock>,
        lock_manager: Arc<LockManager>,
        parallel: Arc<ParallelExecutor>,
    ) -> Self {
        let analyzer_lock = TimeoutLock::new_instance(
            format!("{}_analyzer", spec.engine_name),
            LockPriority::High,
            Duration::from_secs(600),
            lock_manager,
        );
        let status = DetectorStatus {
            engine: spec.engine_name.clone(),
            ..DetectorStatus::default()
        };
        Self {
            core: Arc::new(DetectorCore {
                spec,
                model_cache,
                model_lock,
                analyzer_lock,
                result_cache: DashMap::new(),
                status: Mutex::new(status),
                model: RwLock::new(None),
                initializing: AtomicBool::new(false),
                init_failed: AtomicBool::new(false),
                http: reqwest::Client::new(),
            }),
            parallel,
        }
    }

    /// Injects a ready model, bypassing artifact loading. Used by tests
    /// and by deployments that construct their backend elsewhere.
    pub async fn with_model(self, model: Arc<dyn SpanModel>) -> Self {
        {
            let mut slot = self.core.model.write().await;
            *slot = Some(model);
        }
        {
            let mut status = self.core.status.lock().await;
            status.initialized = true;
            status.model_available = true;
            status.initialization_time = Some(0.0);
        }
        self
    }

    /// The detector's result cache as a memory-pressure flush target.
    pub fn flush_target(&self) -> Arc<dyn FlushTarget> {
        self.core.clone()
    }
}

impl FlushTarget for DetectorCore {
    fn name(&self) -> &str {
        &self.spec.cache_namespace
    }

    fn flush(&self, _severity: CleanupSeverity) {
        self.result_cache.clear();
    }
}

struct PageInput {
    page: u32,
    full_text: String,
    words: Vec<Word>,
    offsets: Vec<WordOffset>,
}

impl DetectorCore {
    /// Cache lookup under both keys this engine's parameters can resolve
    /// to: a local-files-only load and a fallback fetch store distinct
    /// entries, and either satisfies this detector.
    fn cached_model(&self) -> Option<CachedModel> {
        for local_files_only in [true, false] {
            let key = ModelKey::new(
                &self.spec.model_id,
                local_files_only,
                &self.spec.default_entities,
            );
            if let Some(cached) = self.model_cache.get(&key) {
                return Some(cached);
            }
        }
        None
    }

    /// Makes sure a model is available, initializing through the shared
    /// cache if needed. Returns false when the engine stays unusable.
    async fn ensure_initialized(self: &Arc<Self>) -> bool {
        if self.model.read().await.is_some() {
            return true;
        }
        if self.init_failed.load(Ordering::SeqCst) {
            return false;
        }

        if let Some(cached) = self.cached_model() {
            self.adopt(cached).await;
            return true;
        }

        let started = Instant::now();
        let Some(_guard) = self.model_lock.acquire(None).await else {
            warn!(engine = %self.spec.engine_name, "Model lock timed out during initialization");
            return false;
        };

        // Double-checked now that the lock is held.
        if let Some(cached) = self.cached_model() {
            self.adopt(cached).await;
            return true;
        }

        if self.initializing.swap(true, Ordering::SeqCst) {
            // A sibling task is mid-initialization; wait for its cache entry.
            let deadline = Instant::now() + SIBLING_INIT_WAIT;
            while Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(250)).await;
                if let Some(cached) = self.cached_model() {
                    self.adopt(cached).await;
                    return true;
                }
            }
            warn!(engine = %self.spec.engine_name, "Sibling initialization never completed");
            return false;
        }

        let mut local_files_only = true;
        let mut resolved_local_only = true;
        let mut outcome: anyhow::Result<Arc<dyn SpanModel>> =
            Err(anyhow::anyhow!("initialization never attempted"));
        for attempt in 0..=INIT_RETRIES {
            outcome = self.try_build_model(local_files_only).await;
            match &outcome {
                Ok(_) => {
                    resolved_local_only = local_files_only;
                    break;
                }
                Err(error) => {
                    warn!(
                        engine = %self.spec.engine_name,
                        attempt,
                        error = %error,
                        "Model initialization attempt failed"
                    );
                    local_files_only = false;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        self.initializing.store(false, Ordering::SeqCst);

        match outcome {
            Ok(model) => {
                let init_secs = started.elapsed().as_secs_f64();
                // The cache key records how the model was actually loaded;
                // a fallback fetch must not masquerade as local-files-only.
                let key = ModelKey::new(
                    &self.spec.model_id,
                    resolved_local_only,
                    &self.spec.default_entities,
                );
                self.model_cache.insert(
                    key,
                    CachedModel {
                        model: model.clone(),
                        init_secs,
                    },
                );
                {
                    let mut slot = self.model.write().await;
                    *slot = Some(model);
                }
                let mut status = self.status.lock().await;
                status.initialized = true;
                status.model_available = true;
                status.initialization_time = Some(init_secs);
                info!(engine = %self.spec.engine_name, init_secs, "Model initialized");
                true
            }
            Err(error) => {
                self.init_failed.store(true, Ordering::SeqCst);
                let mut status = self.status.lock().await;
                status.failed_calls += 1;
                warn!(engine = %self.spec.engine_name, error = %error, "Model initialization failed; detector disabled");
                false
            }
        }
    }

    async fn try_build_model(&self, local_files_only: bool) -> anyhow::Result<Arc<dyn SpanModel>> {
        let spec = &self.spec;
        if !local_model_exists(&spec.model_dir, &spec.config_file_names) {
            if local_files_only {
                anyhow::bail!(
                    "model directory {} is missing artifacts",
                    spec.model_dir.display()
                );
            }
            let Some(base_url) = &spec.artifact_base_url else {
                anyhow::bail!("no artifact registry configured for {}", spec.model_id);
            };
            fetch_model_artifacts(
                &self.http,
                base_url,
                &spec.model_id,
                &spec.config_file_names,
                &spec.model_dir,
            )
            .await?;
        }

        let Some(endpoint) = &spec.inference_endpoint else {
            anyhow::bail!("no inference endpoint configured for {}", spec.engine_name);
        };
        let model = RemoteSpanModel::new(endpoint.clone(), spec.model_id.clone())?;
        model.health_check().await?;
        Ok(Arc::new(model))
    }

    async fn adopt(&self, cached: CachedModel) {
        {
            let mut slot = self.model.write().await;
            *slot = Some(cached.model);
        }
        let mut status = self.status.lock().await;
        status.initialized = true;
        status.model_available = true;
        status.initialization_time = Some(cached.init_secs);
        debug!(engine = %self.spec.engine_name, "Reusing cached model");
    }

    /// Runs the model over one page's text: result cache, sentence-group
    /// chunking, inference under the analyzer lock, dedup and the pronoun
    /// filter.
    async fn process_text(&self, text: &str, entities: &[String]) -> Vec<Entity> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let cache_key = self.result_cache_key(text, entities);
        if let Some(hit) = self.result_cache.get(&cache_key) {
            debug!(engine = %self.spec.engine_name, "Result cache hit");
            return hit.clone();
        }

        let model = { self.model.read().await.clone() };
        let Some(model) = model else {
            warn!(engine = %self.spec.engine_name, "Model not ready, returning no entities");
            return Vec::new();
        };

        let mut found = Vec::new();
        for chunk in chunk_text(text, MAX_GROUP_CHARS) {
            let Some(_guard) = self.analyzer_lock.acquire(None).await else {
                warn!(engine = %self.spec.engine_name, "Analyzer lock timed out, skipping chunk");
                continue;
            };
            match model
                .predict_spans(&chunk.text, entities, PREDICT_THRESHOLD)
                .await
            {
                Ok(spans) => {
                    for raw in spans {
                        if let Some(entity) = standardize_raw_span(&raw, text, chunk.offset) {
                            found.push(entity);
                        }
                    }
                }
                Err(error) => {
                    warn!(engine = %self.spec.engine_name, error = %error, "Chunk inference failed");
                    self.status.lock().await.failed_calls += 1;
                }
            }
        }

        let filtered =
            filter_pronoun_false_positives(crate::base::dedup_entities(found));
        self.result_cache.insert(cache_key, filtered.clone());
        filtered
    }

    fn result_cache_key(&self, text: &str, entities: &[String]) -> String {
        let mut sorted: Vec<&str> = entities.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let digest = Sha256::digest(format!("{text}|{}", sorted.join(",")).as_bytes());
        format!("{}:{}", self.spec.cache_namespace, hex::encode(digest))
    }

    async fn process_page(
        &self,
        input: PageInput,
        entities: &[String],
    ) -> anyhow::Result<(PageRedaction, Vec<Entity>)> {
        let found = self.process_text(&input.full_text, entities).await;
        if found.is_empty() {
            return Ok((
                PageRedaction {
                    page: input.page,
                    sensitive: Vec::new(),
                },
                Vec::new(),
            ));
        }

        let words = Arc::new(input.words);
        let offsets = Arc::new(input.offsets);
        let (processed, sensitive) =
            process_entities_in_parallel(found, ENTITY_BATCH_SIZE, |batch| {
                let words = words.clone();
                let offsets = offsets.clone();
                async move {
                    let mut entities = Vec::with_capacity(batch.len());
                    let mut spans = Vec::with_capacity(batch.len());
                    for entity in &batch {
                        if let Some((processed, span)) =
                            process_single_entity(entity, &words, &offsets)
                        {
                            entities.push(processed);
                            spans.push(span);
                        }
                    }
                    Ok((entities, spans))
                }
            })
            .await;

        Ok((
            PageRedaction {
                page: input.page,
                sensitive,
            },
            processed,
        ))
    }
}

#[async_trait]
impl EntityDetector for SpanModelDetector {
    fn engine_name(&self) -> &str {
        &self.core.spec.engine_name
    }

    async fn detect_sensitive_data(
        &self,
        extracted: &ExtractedData,
        requested: Option<&[String]>,
    ) -> veil_types::Result<(Vec<Entity>, RedactionMapping)> {
        let started = Instant::now();
        let minimized = minimize_extracted_data(extracted.clone(), &MinimizationConfig::default());

        let validated = match self.core.spec.validate_requested(requested) {
            Ok(validated) if !validated.is_empty() => validated,
            Ok(_) | Err(_) => {
                warn!(engine = %self.core.spec.engine_name, "Requested entities failed validation");
                let mut status = self.core.status.lock().await;
                status.failed_calls += 1;
                return Ok((Vec::new(), RedactionMapping::default()));
            }
        };

        if !self.core.ensure_initialized().await {
            return Ok((Vec::new(), RedactionMapping::default()));
        }

        let page_numbers: Vec<u32> = minimized.pages.iter().map(|p| p.page).collect();
        let inputs: Vec<PageInput> = minimized
            .pages
            .iter()
            .map(|page| {
                let (full_text, offsets) = page.full_text_with_offsets();
                PageInput {
                    page: page.page,
                    full_text,
                    words: page.words.clone(),
                    offsets,
                }
            })
            .collect();

        let core = self.core.clone();
        let entities = Arc::new(validated);
        let worker_entities = entities.clone();
        let results = self
            .parallel
            .process_pages_in_parallel(
                inputs,
                move |_, input| {
                    let core = core.clone();
                    let entities = worker_entities.clone();
                    async move { core.process_page(input, &entities).await }
                },
                None,
                PAGE_TIMEOUT,
            )
            .await;

        let mut all_entities = Vec::new();
        let mut mapping = RedactionMapping::default();
        for (index, outcome) in results {
            match outcome {
                Some((page_redaction, mut entities)) => {
                    mapping.pages.push(page_redaction);
                    all_entities.append(&mut entities);
                }
                None => {
                    // Timed-out or failed page: present but empty.
                    mapping.pages.push(PageRedaction {
                        page: page_numbers[index],
                        sensitive: Vec::new(),
                    });
                }
            }
        }
        mapping.normalize();

        {
            let mut status = self.core.status.lock().await;
            status.total_calls += 1;
            status.last_used = Some(Utc::now());
        }
        info!(
            engine = %self.core.spec.engine_name,
            entities = all_entities.len(),
            pages = mapping.pages.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Detection finished"
        );
        Ok((all_entities, mapping))
    }

    async fn status(&self) -> DetectorStatus {
        let mut status = self.core.status.lock().await.clone();
        status.model_available = self.core.model.read().await.is_some();
        status.model_directory_exists = self.core.spec.model_dir.is_dir();
        status
    }
}

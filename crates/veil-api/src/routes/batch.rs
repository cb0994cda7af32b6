//! Batch endpoints: every uploaded file is processed independently
//! through the parallel core; per-file failures land in the envelope next
//! to the successes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Multipart, State};
use axum::Json;
use base64::Engine as _;
use serde_json::json;
use uuid::Uuid;
use veil_compliance::{minimize_extracted_data, MinimizationConfig};
use veil_detect::base::filter_entities_by_score;
use veil_detect::EntityDetector;
use veil_parallel::ParallelOptions;
use veil_pdf::{PdfConfig, PdfExtractor, PdfRedactor};
use veil_sync::LockManager;
use veil_types::RedactionMapping;

use crate::errors::ApiError;
use crate::models::{BatchResponse, BatchSummary, FileResult};
use crate::routes::{
    parse_requested_entities, parse_threshold, read_multipart, require_pdf,
};
use crate::state::AppContext;

const BATCH_ITEM_TIMEOUT: Duration = Duration::from_secs(600);
const BATCH_TOTAL_TIMEOUT: Duration = Duration::from_secs(600);

fn pdf_config(context: &AppContext) -> PdfConfig {
    PdfConfig {
        max_size_bytes: context.config.max_upload_bytes,
        ..PdfConfig::default()
    }
}

async fn run_batch<F, Fut>(
    context: &AppContext,
    files: Vec<(String, Vec<u8>)>,
    operation: &str,
    per_file: F,
) -> BatchResponse
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    let started = Instant::now();
    let batch_id = Uuid::new_v4().to_string();
    let total_files = files.len();
    let names: Vec<String> = files.iter().map(|(name, _)| name.clone()).collect();

    let options = ParallelOptions {
        item_timeout: BATCH_ITEM_TIMEOUT,
        batch_timeout: BATCH_TOTAL_TIMEOUT,
        operation_id: batch_id.clone(),
        ..ParallelOptions::default()
    };
    let workers = context.parallel.optimal_workers(total_files, &options).await;

    let outcomes = context
        .parallel
        .process_in_parallel(
            files,
            move |_, (name, bytes)| per_file(name, bytes),
            options,
        )
        .await;

    let mut file_results = Vec::with_capacity(total_files);
    let mut successful = 0usize;
    for (index, outcome) in outcomes {
        match outcome {
            Some(results) => {
                successful += 1;
                file_results.push(FileResult::success(&names[index], results));
            }
            None => file_results.push(FileResult::failure(
                &names[index],
                "processing failed or timed out",
            )),
        }
    }

    let total_time = started.elapsed().as_secs_f64();
    let _ = context
        .records
        .record_processing(
            operation,
            "PDF",
            Vec::new(),
            total_time,
            total_files,
            0,
            successful == total_files,
        )
        .await;

    BatchResponse {
        batch_summary: BatchSummary {
            batch_id,
            total_files,
            successful,
            failed: total_files - successful,
            total_time,
            workers: Some(workers),
        },
        file_results,
        debug: None,
    }
}

fn batch_files(form: super::UploadForm) -> Result<(Vec<(String, Vec<u8>)>, std::collections::BTreeMap<String, String>), ApiError> {
    if form.files.is_empty() {
        return Err(ApiError::validation("no files uploaded"));
    }
    for (name, bytes) in &form.files {
        require_pdf(bytes, name)?;
    }
    Ok((form.files, form.fields))
}

async fn detect_batch(
    context: Arc<AppContext>,
    mut multipart: Multipart,
    engine: &str,
) -> Result<Json<BatchResponse>, ApiError> {
    let form = read_multipart(&mut multipart, context.config.max_upload_bytes).await?;
    let (files, fields) = batch_files(form)?;
    let requested = parse_requested_entities(fields.get("requested_entities"))?;
    let threshold = parse_threshold(fields.get("threshold"))?;
    let detector = context.detector_for(engine)?;

    let lock_manager = context.lock_manager.clone();
    let config = pdf_config(&context);
    let response = run_batch(&context, files, "batch_detection", move |_name, bytes| {
        let detector: Arc<dyn EntityDetector> = detector.clone();
        let requested = requested.clone();
        let lock_manager = lock_manager.clone();
        let config = config.clone();
        async move {
            let extractor = PdfExtractor::from_bytes(&bytes, config, lock_manager)?;
            let extracted = extractor.extract_text().await;
            let (mut entities, mut mapping) = detector
                .detect_sensitive_data(&extracted, requested.as_deref())
                .await?;
            if let Some(threshold) = threshold {
                entities = filter_entities_by_score(entities, threshold);
                for page in &mut mapping.pages {
                    page.sensitive.retain(|s| s.score >= threshold);
                }
            }
            let entity_count = entities.len();
            Ok(json!({
                "entities": entities,
                "redaction_mapping": mapping,
                "entity_count": entity_count,
            }))
        }
    })
    .await;
    Ok(Json(response))
}

pub async fn detect(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    detect_batch(context, multipart, "span").await
}

pub async fn hybrid_detect(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    detect_batch(context, multipart, "hybrid").await
}

pub async fn extract(
    State(context): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    let form = read_multipart(&mut multipart, context.config.max_upload_bytes).await?;
    let (files, _) = batch_files(form)?;

    let lock_manager = context.lock_manager.clone();
    let config = pdf_config(&context);
    let response = run_batch(&context, files, "batch_extraction", move |_name, bytes| {
        let lock_manager = lock_manager.clone();
        let config = config.clone();
        async move {
            let extractor = PdfExtractor::from_bytes(&bytes, config, lock_manager)?;
            let extracted = extractor.extract_text().await;
            let minimized = minimize_extracted_data(extracted, &MinimizationConfig::default());
            Ok(serde_json::to_value(minimized)?)
        }
    })
    .await;
    Ok(Json(response))
}

pub async fn redact(
    State(context): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    let form = read_multipart(&mut multipart, context.config.max_upload_bytes).await?;
    let (files, fields) = batch_files(form)?;
    let mapping_raw = fields
        .get("redaction_mapping")
        .ok_or_else(|| ApiError::validation("missing redaction_mapping field"))?;
    let mapping: RedactionMapping = serde_json::from_str(mapping_raw)
        .map_err(|e| ApiError::validation(format!("malformed redaction mapping: {e}")))?;

    let lock_manager: Arc<LockManager> = context.lock_manager.clone();
    let config = pdf_config(&context);
    let response = run_batch(&context, files, "batch_redaction", move |_name, bytes| {
        let mapping = mapping.clone();
        let lock_manager = lock_manager.clone();
        let config = config.clone();
        async move {
            let redactor = PdfRedactor::from_bytes(&bytes, &config, lock_manager)?;
            let output = redactor.apply(&mapping, &[]).await?;
            Ok(json!({
                "pdf_base64": base64::engine::general_purpose::STANDARD.encode(&output),
                "size_bytes": output.len(),
                "spans_applied": mapping.total_spans(),
            }))
        }
    })
    .await;
    Ok(Json(response))
}

/// Shared implementation of the word-search endpoints. `exact` demands
/// whole-word equality; otherwise substring containment counts.
async fn word_search(
    context: Arc<AppContext>,
    mut multipart: Multipart,
    field: &'static str,
    exact: bool,
) -> Result<Json<BatchResponse>, ApiError> {
    let form = read_multipart(&mut multipart, context.config.max_upload_bytes).await?;
    let (files, fields) = batch_files(form)?;
    let raw_terms = fields
        .get(field)
        .ok_or_else(|| ApiError::validation(format!("missing {field} field")))?;
    let terms: Vec<String> = raw_terms
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if terms.is_empty() {
        return Err(ApiError::validation("no search terms given"));
    }

    let lock_manager = context.lock_manager.clone();
    let config = pdf_config(&context);
    let operation = if exact { "batch_search" } else { "batch_find_words" };
    let response = run_batch(&context, files, operation, move |_name, bytes| {
        let terms = terms.clone();
        let lock_manager = lock_manager.clone();
        let config = config.clone();
        async move {
            let extractor = PdfExtractor::from_bytes(&bytes, config, lock_manager)?;
            let extracted = extractor.extract_text().await;
            let mut pages = Vec::new();
            let mut match_count = 0usize;
            for page in &extracted.pages {
                let matches: Vec<serde_json::Value> = page
                    .words
                    .iter()
                    .filter(|word| {
                        let lowered = word.text.to_lowercase();
                        terms.iter().any(|term| {
                            if exact {
                                lowered == *term
                            } else {
                                lowered.contains(term)
                            }
                        })
                    })
                    .map(|word| json!({ "text": word.text, "bbox": word.bbox }))
                    .collect();
                if !matches.is_empty() {
                    match_count += matches.len();
                    pages.push(json!({ "page": page.page, "matches": matches }));
                }
            }
            Ok(json!({ "pages": pages, "match_count": match_count }))
        }
    })
    .await;
    Ok(Json(response))
}

pub async fn search(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    word_search(context, multipart, "search_terms", true).await
}

pub async fn find_words(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    word_search(context, multipart, "words", false).await
}

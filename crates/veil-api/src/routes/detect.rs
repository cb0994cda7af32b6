//! Single-file detection endpoints.
//!
//! All four routes share one pipeline — validate, extract, minimize,
//! detect, filter, record — differing only in which engine they resolve.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, State};
use axum::Json;
use serde_json::json;
use tracing::info;
use veil_detect::base::filter_entities_by_score;
use veil_pdf::{PdfConfig, PdfExtractor};

use crate::errors::ApiError;
use crate::models::{DetectionResponse, FileInfo, ModelInfo, Performance};
use crate::routes::{
    parse_bool, parse_requested_entities, parse_threshold, read_multipart, require_pdf,
};
use crate::state::AppContext;

pub async fn ai_detect(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<DetectionResponse>, ApiError> {
    detect_impl(context, multipart, "llm").await
}

pub async fn ml_detect(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<DetectionResponse>, ApiError> {
    detect_impl(context, multipart, "pattern").await
}

pub async fn gl_detect(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<DetectionResponse>, ApiError> {
    detect_impl(context, multipart, "span").await
}

pub async fn hm_detect(
    State(context): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<DetectionResponse>, ApiError> {
    detect_impl(context, multipart, "span_no").await
}

async fn detect_impl(
    context: Arc<AppContext>,
    mut multipart: Multipart,
    engine: &str,
) -> Result<Json<DetectionResponse>, ApiError> {
    let started = Instant::now();
    let form = read_multipart(&mut multipart, context.config.max_upload_bytes).await?;
    let (filename, bytes) = form
        .files
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::validation("no file uploaded"))?;
    require_pdf(&bytes, &filename)?;

    let requested = parse_requested_entities(form.fields.get("requested_entities"))?;
    let threshold = parse_threshold(form.fields.get("threshold"))?;
    let remove_words = parse_bool(form.fields.get("remove_words"));

    let detector = context.detector_for(engine)?;

    let Some(_permit) = context.pdf_semaphore.acquire(None).await else {
        return Err(ApiError::Overloaded {
            message: "too many concurrent PDF operations, retry shortly".to_string(),
        });
    };
    let token = context.memory_tracker.begin("detect");
    let config = PdfConfig {
        max_size_bytes: context.config.max_upload_bytes,
        ..PdfConfig::default()
    };
    let extractor = PdfExtractor::from_bytes(&bytes, config, context.lock_manager.clone())?;
    let extraction_started = Instant::now();
    let extracted = extractor.extract_text().await;
    let extraction_ms = extraction_started.elapsed().as_millis() as u64;

    let detection_started = Instant::now();
    let (entities, mut mapping) = detector
        .detect_sensitive_data(&extracted, requested.as_deref())
        .await?;
    let detection_ms = detection_started.elapsed().as_millis() as u64;
    context.memory_tracker.finish(token).await;

    let mut entities = entities;
    if let Some(threshold) = threshold {
        entities = filter_entities_by_score(entities, threshold);
        for page in &mut mapping.pages {
            page.sensitive.retain(|s| s.score >= threshold);
        }
    }
    if !remove_words {
        // Data minimization: matched strings only leave the service when
        // the caller needs them for text-level redaction.
        for page in &mut mapping.pages {
            for span in &mut page.sensitive {
                span.original_text = None;
            }
        }
    }

    let entity_types: Vec<String> = entities.iter().map(|e| e.entity_type.clone()).collect();
    let _ = context
        .records
        .record_processing(
            "detection",
            "PDF",
            entity_types,
            started.elapsed().as_secs_f64(),
            1,
            entities.len(),
            extracted.error.is_none(),
        )
        .await;

    let status = detector.status().await;
    info!(
        engine,
        entities = entities.len(),
        total_ms = started.elapsed().as_millis() as u64,
        "Detection request served"
    );

    Ok(Json(DetectionResponse {
        entities,
        redaction_mapping: mapping,
        performance: Performance {
            extraction_ms,
            detection_ms: Some(detection_ms),
            total_ms: started.elapsed().as_millis() as u64,
            pages_processed: extracted.content_pages,
            memory_usage_percent: Some(context.memory.usage_percent()),
        },
        file_info: FileInfo {
            filename,
            size_bytes: bytes.len(),
            content_type: "application/pdf".to_string(),
        },
        model_info: ModelInfo {
            engine: status.engine,
            initialized: status.initialized,
        },
        debug: Some(json!({
            "threshold": threshold,
            "remove_words": remove_words,
            "empty_pages": extracted.empty_pages,
        })),
    }))
}

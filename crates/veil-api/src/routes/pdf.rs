//! `/pdf/extract` and `/pdf/redact`.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, Response};
use axum::Json;
use veil_compliance::{minimize_extracted_data, MinimizationConfig};
use veil_pdf::{PdfConfig, PdfExtractor, PdfRedactor};
use veil_types::RedactionMapping;

use crate::errors::ApiError;
use crate::models::{ExtractResponse, FileInfo, Performance};
use crate::routes::{parse_bool, read_multipart, require_pdf};
use crate::state::AppContext;

fn pdf_config(context: &AppContext) -> PdfConfig {
    PdfConfig {
        max_size_bytes: context.config.max_upload_bytes,
        ..PdfConfig::default()
    }
}

/// Extracts positional text from one uploaded PDF and returns the
/// minimized result.
pub async fn extract(
    State(context): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Json<ExtractResponse>, ApiError> {
    let started = Instant::now();
    let form = read_multipart(&mut multipart, context.config.max_upload_bytes).await?;
    let (filename, bytes) = form
        .files
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::validation("no file uploaded"))?;
    require_pdf(&bytes, &filename)?;

    let Some(_permit) = context.pdf_semaphore.acquire(None).await else {
        return Err(ApiError::Overloaded {
            message: "too many concurrent PDF operations, retry shortly".to_string(),
        });
    };
    let token = context.memory_tracker.begin("pdf_extract");
    let extractor = PdfExtractor::from_bytes(&bytes, pdf_config(&context), context.lock_manager.clone())?;
    let extraction_started = Instant::now();
    let data = extractor.extract_text().await;
    let extraction_ms = extraction_started.elapsed().as_millis() as u64;

    let minimized = minimize_extracted_data(data, &MinimizationConfig::default());
    context.memory_tracker.finish(token).await;

    let pages_processed = minimized.content_pages;
    let success = minimized.error.is_none();
    let _ = context
        .records
        .record_processing(
            "extraction",
            "PDF",
            Vec::new(),
            started.elapsed().as_secs_f64(),
            1,
            0,
            success,
        )
        .await;

    Ok(Json(ExtractResponse {
        data: minimized,
        performance: Performance {
            extraction_ms,
            detection_ms: None,
            total_ms: started.elapsed().as_millis() as u64,
            pages_processed,
            memory_usage_percent: Some(context.memory.usage_percent()),
        },
        file_info: FileInfo {
            filename,
            size_bytes: bytes.len(),
            content_type: "application/pdf".to_string(),
        },
        debug: None,
    }))
}

/// Applies a redaction mapping to one uploaded PDF and returns the
/// rewritten bytes.
pub async fn redact(
    State(context): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Response<Body>, ApiError> {
    let started = Instant::now();
    let form = read_multipart(&mut multipart, context.config.max_upload_bytes).await?;
    let (filename, bytes) = form
        .files
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::validation("no file uploaded"))?;
    require_pdf(&bytes, &filename)?;

    let mapping_raw = form
        .fields
        .get("redaction_mapping")
        .ok_or_else(|| ApiError::validation("missing redaction_mapping field"))?;
    let mapping: RedactionMapping = serde_json::from_str(mapping_raw)
        .map_err(|e| ApiError::validation(format!("malformed redaction mapping: {e}")))?;
    let redact_images = parse_bool(form.fields.get("remove_images"));

    let Some(_permit) = context.pdf_semaphore.acquire(None).await else {
        return Err(ApiError::Overloaded {
            message: "too many concurrent PDF operations, retry shortly".to_string(),
        });
    };
    let config = pdf_config(&context);
    let image_boxes = if redact_images {
        let extractor = PdfExtractor::from_bytes(&bytes, config.clone(), context.lock_manager.clone())?;
        mapping
            .pages
            .iter()
            .map(|p| (p.page, extractor.images_on_page(p.page)))
            .collect()
    } else {
        Vec::new()
    };

    let redactor = PdfRedactor::from_bytes(&bytes, &config, context.lock_manager.clone())?;
    let output = redactor.apply(&mapping, &image_boxes).await?;

    let _ = context
        .records
        .record_processing(
            "redaction",
            "PDF",
            mapping
                .pages
                .iter()
                .flat_map(|p| p.sensitive.iter().map(|s| s.entity_type.clone()))
                .collect(),
            started.elapsed().as_secs_f64(),
            1,
            mapping.total_spans(),
            true,
        )
        .await;

    Response::builder()
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"redacted_{filename}\""),
        )
        .body(Body::from(output))
        .map_err(|e| ApiError::Internal {
            detail: format!("response build failed: {e}"),
        })
}

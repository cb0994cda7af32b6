pub mod batch;
pub mod detect;
pub mod help;
pub mod pdf;
pub mod status;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart};
use axum::http::{HeaderValue, Request};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::errors::ApiError;
use crate::middleware::{caching::response_cache_middleware, security::security_headers_middleware};
use crate::state::AppContext;

/// Parsed multipart upload: file parts in arrival order plus text fields.
pub struct UploadForm {
    pub files: Vec<(String, Vec<u8>)>,
    pub fields: BTreeMap<String, String>,
}

/// Drains a multipart body. Parts with a filename are treated as uploads;
/// the rest become text fields. Oversized parts are rejected outright.
pub async fn read_multipart(
    multipart: &mut Multipart,
    max_bytes: u64,
) -> Result<UploadForm, ApiError> {
    let mut files = Vec::new();
    let mut fields = BTreeMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("unreadable file part: {e}")))?;
                if bytes.len() as u64 > max_bytes {
                    return Err(ApiError::PayloadTooLarge {
                        message: format!("file {filename:?} exceeds {max_bytes} bytes"),
                    });
                }
                files.push((safe_filename(&filename), bytes.to_vec()));
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::validation(format!("unreadable field {name:?}: {e}")))?;
                fields.insert(name, text);
            }
        }
    }
    Ok(UploadForm { files, fields })
}

/// Strips any path components a client smuggled into the filename.
pub fn safe_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        "upload.pdf".to_string()
    } else {
        base.to_string()
    }
}

/// PDF uploads must actually be PDFs.
pub fn require_pdf(bytes: &[u8], filename: &str) -> Result<(), ApiError> {
    if !bytes.starts_with(b"%PDF-") {
        return Err(ApiError::UnsupportedMediaType {
            message: format!("{filename:?} is not a PDF document"),
        });
    }
    Ok(())
}

/// Optional threshold field; must parse into [0, 1].
pub fn parse_threshold(raw: Option<&String>) -> Result<Option<f64>, ApiError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::validation(format!("threshold {raw:?} is not a number")))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ApiError::validation(format!(
            "threshold {value} is outside [0, 1]"
        )));
    }
    Ok(Some(value))
}

/// Optional requested-entities field: a JSON array of strings.
pub fn parse_requested_entities(raw: Option<&String>) -> Result<Option<Vec<String>>, ApiError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let parsed: Vec<String> = serde_json::from_str(raw).map_err(|e| {
        ApiError::validation(format!("requested_entities must be a JSON string array: {e}"))
    })?;
    Ok(Some(parsed))
}

pub fn parse_bool(raw: Option<&String>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// Gives each request its own lock-holder context, so the hierarchy check
/// tracks the request task rather than the worker thread it lands on.
async fn lock_context_middleware(req: Request<Body>, next: Next) -> Response {
    veil_sync::with_lock_context(next.run(req)).await
}

fn cors_layer(context: &AppContext) -> CorsLayer {
    let origins: Vec<HeaderValue> = context
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::new()
    } else {
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    }
}

/// Builds the full application router.
pub fn build_router(context: Arc<AppContext>) -> Router {
    let cors = cors_layer(&context);
    let body_limit = DefaultBodyLimit::max(context.config.max_upload_bytes as usize + 1024 * 1024);
    Router::new()
        .route("/pdf/extract", post(pdf::extract))
        .route("/pdf/redact", post(pdf::redact))
        .route("/ai/detect", post(detect::ai_detect))
        .route("/ml/detect", post(detect::ml_detect))
        .route("/ml/gl_detect", post(detect::gl_detect))
        .route("/ml/hm_detect", post(detect::hm_detect))
        .route("/batch/detect", post(batch::detect))
        .route("/batch/hybrid_detect", post(batch::hybrid_detect))
        .route("/batch/extract", post(batch::extract))
        .route("/batch/redact", post(batch::redact))
        .route("/batch/search", post(batch::search))
        .route("/batch/find_words", post(batch::find_words))
        .route("/status", get(status::status))
        .route("/health", get(status::health))
        .route("/metrics", get(status::metrics))
        .route("/readiness", get(status::readiness))
        .route("/help/engines", get(help::engines))
        .route("/help/entities", get(help::entities))
        .route("/help/entity-examples", get(help::entity_examples))
        .route("/help/detectors-status", get(help::detectors_status))
        .route("/help/routes", get(help::routes))
        .layer(from_fn_with_state(
            context.clone(),
            response_cache_middleware,
        ))
        .layer(from_fn_with_state(
            context.clone(),
            security_headers_middleware,
        ))
        .layer(from_fn(lock_context_middleware))
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

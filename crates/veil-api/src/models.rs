use serde::{Deserialize, Serialize};
use serde_json::Value;
use veil_types::{Entity, ExtractedData, RedactionMapping};

/// Timing and sizing facts attached to every successful response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performance {
    pub extraction_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_ms: Option<u64>,
    pub total_ms: u64,
    pub pages_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub size_bytes: usize,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub engine: String,
    pub initialized: bool,
}

/// Body of the single-file detection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub entities: Vec<Entity>,
    pub redaction_mapping: RedactionMapping,
    pub performance: Performance,
    pub file_info: FileInfo,
    pub model_info: ModelInfo,
    #[serde(rename = "_debug", skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

/// Body of `/pdf/extract`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    #[serde(flatten)]
    pub data: ExtractedData,
    pub performance: Performance,
    pub file_info: FileInfo,
    #[serde(rename = "_debug", skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

/// Summary header of every batch envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

/// One file's outcome inside a batch envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub file: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    pub fn success(file: impl Into<String>, results: Value) -> Self {
        Self {
            file: file.into(),
            status: "success".to_string(),
            results: Some(results),
            error: None,
        }
    }

    pub fn failure(file: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            status: "error".to_string(),
            results: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub batch_summary: BatchSummary,
    pub file_results: Vec<FileResult>,
    #[serde(rename = "_debug", skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

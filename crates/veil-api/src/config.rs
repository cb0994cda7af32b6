use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Service configuration, populated from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// `development` relaxes the CSP; anything else keeps it strict.
    pub environment: String,
    /// Origins allowed by CORS; empty means same-origin only.
    pub allowed_origins: Vec<String>,
    /// Root directory for span-model artifacts.
    pub model_root: PathBuf,
    /// Processing-record directory.
    pub records_dir: PathBuf,
    pub retention_days: u32,
    /// Default TTL for cached responses.
    pub cache_ttl: Duration,
    /// Upper bound on uploaded PDF size.
    pub max_upload_bytes: u64,
    /// Concurrent PDF operations allowed across the process.
    pub pdf_concurrency: usize,
    /// Inference endpoint for span-model engines, when deployed.
    pub inference_endpoint: Option<String>,
    /// Artifact registry for model downloads, when deployed.
    pub artifact_base_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 8080).into(),
            environment: "production".to_string(),
            allowed_origins: Vec::new(),
            model_root: PathBuf::from("models"),
            records_dir: PathBuf::from("logs/processing_records"),
            retention_days: 90,
            cache_ttl: Duration::from_secs(300),
            max_upload_bytes: 100 * 1024 * 1024,
            pdf_concurrency: 4,
            inference_endpoint: None,
            artifact_base_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("VEIL_BIND_ADDR") {
            if let Ok(addr) = value.parse() {
                config.bind_addr = addr;
            }
        }
        if let Ok(value) = std::env::var("ENVIRONMENT") {
            if !value.is_empty() {
                config.environment = value;
            }
        }
        if let Ok(value) = std::env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(value) = std::env::var("VEIL_MODEL_ROOT") {
            config.model_root = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("VEIL_RECORDS_DIR") {
            config.records_dir = PathBuf::from(value);
        }
        if let Some(days) = env_parse::<u32>("VEIL_RETENTION_DAYS") {
            config.retention_days = days;
        }
        if let Some(secs) = env_parse::<u64>("VEIL_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse::<u64>("VEIL_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = bytes;
        }
        if let Some(permits) = env_parse::<usize>("VEIL_PDF_CONCURRENCY") {
            config.pdf_concurrency = permits.max(1);
        }
        config.inference_endpoint = std::env::var("VEIL_INFERENCE_ENDPOINT")
            .ok()
            .filter(|v| !v.is_empty());
        config.artifact_base_url = std::env::var("VEIL_ARTIFACT_BASE_URL")
            .ok()
            .filter(|v| !v.is_empty());
        config
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

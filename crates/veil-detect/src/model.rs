//! Span-model backends and the process-wide model cache.
//!
//! A span model takes a text chunk plus candidate labels and returns
//! scored spans. The production backend drives a remote inference server
//! over HTTP; model artifacts (weights plus configuration) are managed in
//! a local directory and fetched by model id when missing. The cache is a
//! flat map keyed by initialization parameters — detectors refer to cache
//! keys, never to each other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use veil_types::RawSpan;

/// Weights file every usable model directory must contain.
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// A model that predicts labeled spans over a chunk of text. Offsets in
/// returned spans are character offsets relative to the chunk.
#[async_trait]
pub trait SpanModel: Send + Sync {
    async fn predict_spans(
        &self,
        text: &str,
        labels: &[String],
        threshold: f64,
    ) -> anyhow::Result<Vec<RawSpan>>;
}

/// Cache key: the initialization parameters that make two detector
/// configurations share one model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model_id: String,
    pub local_files_only: bool,
    /// Sorted copy of the default entity labels.
    pub entities: Vec<String>,
}

impl ModelKey {
    pub fn new(model_id: &str, local_files_only: bool, entities: &[String]) -> Self {
        let mut entities: Vec<String> = entities.to_vec();
        entities.sort();
        Self {
            model_id: model_id.to_string(),
            local_files_only,
            entities,
        }
    }
}

/// One cached model plus how long it took to initialize.
#[derive(Clone)]
pub struct CachedModel {
    pub model: Arc<dyn SpanModel>,
    pub init_secs: f64,
}

/// Process-wide model cache. Lookup and insertion happen under the
/// HIGH-priority model lock held by the initializing detector.
#[derive(Default)]
pub struct ModelCache {
    entries: DashMap<ModelKey, CachedModel>,
}

impl ModelCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &ModelKey) -> Option<CachedModel> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn insert(&self, key: ModelKey, model: CachedModel) {
        self.entries.insert(key, model);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// True when the directory holds a usable model: the weights file plus at
/// least one recognized configuration file.
pub fn local_model_exists(dir: &Path, config_file_names: &[String]) -> bool {
    if !dir.join(WEIGHTS_FILE).is_file() {
        return false;
    }
    config_file_names.iter().any(|name| dir.join(name).is_file())
}

/// Downloads model artifacts by id into `dir`. The artifact layout mirrors
/// the directory contract: one weights file plus the first configuration
/// file name.
pub async fn fetch_model_artifacts(
    client: &reqwest::Client,
    base_url: &str,
    model_id: &str,
    config_file_names: &[String],
    dir: &Path,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let config_name = config_file_names
        .first()
        .map(String::as_str)
        .unwrap_or("config.json");
    for file in [WEIGHTS_FILE, config_name] {
        let url = format!("{}/{}/resolve/main/{}", base_url.trim_end_matches('/'), model_id, file);
        debug!(url = %url, "Fetching model artifact");
        let response = client.get(&url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        tokio::fs::write(dir.join(file), &bytes).await?;
        info!(file, bytes = bytes.len(), model_id, "Model artifact stored");
    }
    Ok(())
}

/// Request body for the remote inference server.
#[derive(Debug, Serialize)]
struct InferenceRequest<'a> {
    text: &'a str,
    labels: &'a [String],
    threshold: f64,
    model: &'a str,
}

/// One span as the inference server reports it.
#[derive(Debug, Deserialize)]
struct InferenceSpan {
    label: String,
    start: usize,
    end: usize,
    score: f64,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    entities: Vec<InferenceSpan>,
}

/// Span model served by a remote inference endpoint. Prediction is one
/// POST per chunk; the server holds the weights loaded from the same
/// artifact directory this process manages.
pub struct RemoteSpanModel {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
}

impl RemoteSpanModel {
    pub fn new(endpoint: impl Into<String>, model_id: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model_id: model_id.into(),
        })
    }

    /// Verifies the endpoint is reachable and serving this model.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/health", self.endpoint.trim_end_matches('/'));
        self.client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SpanModel for RemoteSpanModel {
    async fn predict_spans(
        &self,
        text: &str,
        labels: &[String],
        threshold: f64,
    ) -> anyhow::Result<Vec<RawSpan>> {
        let url = format!("{}/predict", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&InferenceRequest {
                text,
                labels,
                threshold,
                model: &self.model_id,
            })
            .send()
            .await?
            .error_for_status()?;
        let parsed: InferenceResponse = response.json().await?;
        if parsed.entities.is_empty() {
            debug!(chunk_chars = text.chars().count(), "Inference returned no spans");
        }
        Ok(parsed
            .entities
            .into_iter()
            .map(|span| RawSpan {
                label: span.label,
                start: span.start,
                end: span.end,
                score: span.score,
                text: span.text,
            })
            .collect())
    }
}

/// Deterministic in-process model for tests: maps known phrases to labels
/// and reports every occurrence above the threshold.
pub struct MockSpanModel {
    terms: HashMap<String, (String, f64)>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockSpanModel {
    pub fn new() -> Self {
        Self {
            terms: HashMap::new(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn with_term(mut self, phrase: &str, label: &str, score: f64) -> Self {
        self.terms
            .insert(phrase.to_string(), (label.to_string(), score));
        self
    }

    /// Number of prediction calls served so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for MockSpanModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpanModel for MockSpanModel {
    async fn predict_spans(
        &self,
        text: &str,
        labels: &[String],
        threshold: f64,
    ) -> anyhow::Result<Vec<RawSpan>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let chars: Vec<char> = text.chars().collect();
        let mut spans = Vec::new();
        for (phrase, (label, score)) in &self.terms {
            if *score < threshold || !labels.iter().any(|l| l == label) {
                continue;
            }
            let needle: Vec<char> = phrase.chars().collect();
            if needle.is_empty() {
                continue;
            }
            let mut at = 0usize;
            while at + needle.len() <= chars.len() {
                if chars[at..at + needle.len()] == needle[..] {
                    spans.push(RawSpan {
                        label: label.clone(),
                        start: at,
                        end: at + needle.len(),
                        score: *score,
                        text: phrase.clone(),
                    });
                    at += needle.len();
                } else {
                    at += 1;
                }
            }
        }
        spans.sort_by_key(|s| s.start);
        if spans.is_empty() {
            debug!("Mock model produced no spans");
        }
        Ok(spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_model_key_sorts_entities() {
        let a = ModelKey::new("m", true, &["B".into(), "A".into()]);
        let b = ModelKey::new("m", true, &["A".into(), "B".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_roundtrip() {
        let cache = ModelCache::new();
        let key = ModelKey::new("m", false, &[]);
        assert!(cache.get(&key).is_none());
        cache.insert(
            key.clone(),
            CachedModel {
                model: Arc::new(MockSpanModel::new()),
                init_secs: 0.5,
            },
        );
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_local_model_detection() {
        let dir = TempDir::new().unwrap();
        let configs = vec!["config.json".to_string(), "span_config.json".to_string()];
        assert!(!local_model_exists(dir.path(), &configs));

        std::fs::write(dir.path().join(WEIGHTS_FILE), b"weights").unwrap();
        assert!(!local_model_exists(dir.path(), &configs));

        std::fs::write(dir.path().join("span_config.json"), b"{}").unwrap();
        assert!(local_model_exists(dir.path(), &configs));
    }

    #[tokio::test]
    async fn test_mock_model_finds_occurrences() {
        let model = MockSpanModel::new().with_term("John Doe", "PERSON", 0.9);
        let labels = vec!["PERSON".to_string()];
        let spans = model
            .predict_spans("John Doe met John Doe.", &labels, 0.4)
            .await
            .unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans[1].start, 13);
    }

    #[tokio::test]
    async fn test_mock_model_honors_threshold_and_labels() {
        let model = MockSpanModel::new().with_term("John", "PERSON", 0.3);
        let labels = vec!["PERSON".to_string()];
        assert!(model
            .predict_spans("John", &labels, 0.4)
            .await
            .unwrap()
            .is_empty());
        let other = vec!["LOCATION".to_string()];
        assert!(model
            .predict_spans("John", &other, 0.2)
            .await
            .unwrap()
            .is_empty());
    }
}

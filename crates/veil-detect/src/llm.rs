//! LLM-backed detection engine.
//!
//! Sends page text to a chat-completion endpoint and asks for sensitive
//! spans as JSON. The model reports the matched strings, not offsets;
//! offsets are recovered by locating each string in the page text, which
//! keeps invariant checking on our side of the wire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use veil_compliance::{minimize_extracted_data, MinimizationConfig};
use veil_types::{
    DetectorStatus, Entity, ExtractedData, PageRedaction, RedactionMapping,
};

use crate::base::{dedup_entities, process_single_entity};
use crate::EntityDetector;

/// Score assigned to LLM findings; the endpoint reports no confidence.
const LLM_SCORE: f64 = 0.80;

/// Configuration for the LLM engine.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
    pub default_entities: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "veil-redact-1".to_string(),
            request_timeout: Duration::from_secs(60),
            default_entities: [
                "PERSON",
                "EMAIL",
                "PHONE",
                "ADDRESS",
                "NATIONAL_ID",
                "ORGANISATION",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl LlmConfig {
    /// Reads `VEIL_LLM_ENDPOINT`, `VEIL_LLM_API_KEY` and `VEIL_LLM_MODEL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.endpoint = std::env::var("VEIL_LLM_ENDPOINT").ok().filter(|v| !v.is_empty());
        config.api_key = std::env::var("VEIL_LLM_API_KEY").ok().filter(|v| !v.is_empty());
        if let Ok(model) = std::env::var("VEIL_LLM_MODEL") {
            if !model.is_empty() {
                config.model = model;
            }
        }
        config
    }
}

#[derive(Debug, Deserialize)]
struct LlmSpan {
    label: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct LlmFindings {
    #[serde(default)]
    entities: Vec<LlmSpan>,
}

/// Detection engine backed by a remote chat-completion endpoint.
pub struct LlmDetector {
    config: LlmConfig,
    client: reqwest::Client,
    status: Mutex<DetectorStatus>,
}

impl LlmDetector {
    pub fn new(config: LlmConfig) -> Arc<Self> {
        let available = config.endpoint.is_some();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            client,
            status: Mutex::new(DetectorStatus {
                engine: "llm".to_string(),
                initialized: available,
                model_available: available,
                initialization_time: available.then_some(0.0),
                ..DetectorStatus::default()
            }),
        })
    }

    fn labels(&self, requested: Option<&[String]>) -> Vec<String> {
        match requested {
            None => self.config.default_entities.clone(),
            Some(labels) => labels
                .iter()
                .filter(|label| {
                    self.config
                        .default_entities
                        .iter()
                        .any(|known| known.eq_ignore_ascii_case(label))
                })
                .map(|label| label.to_uppercase())
                .collect(),
        }
    }

    async fn query_page(&self, text: &str, labels: &[String]) -> anyhow::Result<Vec<LlmSpan>> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no LLM endpoint configured"))?;
        let prompt = format!(
            "Find sensitive information in the text below. Report only the \
             categories {labels:?}. Respond with JSON of the form \
             {{\"entities\":[{{\"label\":\"...\",\"text\":\"...\"}}]}} and \
             nothing else.\n\nTEXT:\n{text}"
        );
        let mut request = self.client.post(endpoint).json(&json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.0,
        }));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response: serde_json::Value = request.send().await?.error_for_status()?.json().await?;
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("completion response has no content"))?;
        let stripped = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        let findings: LlmFindings = serde_json::from_str(stripped)?;
        Ok(findings.entities)
    }

    /// Every occurrence of `needle` in `haystack`, as character offsets.
    fn occurrences(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
        if needle.is_empty() {
            return Vec::new();
        }
        let chars: Vec<char> = haystack.chars().collect();
        let target: Vec<char> = needle.chars().collect();
        let mut hits = Vec::new();
        let mut at = 0usize;
        while at + target.len() <= chars.len() {
            if chars[at..at + target.len()] == target[..] {
                hits.push((at, at + target.len()));
                at += target.len();
            } else {
                at += 1;
            }
        }
        hits
    }
}

#[async_trait]
impl EntityDetector for LlmDetector {
    fn engine_name(&self) -> &str {
        "llm"
    }

    async fn detect_sensitive_data(
        &self,
        extracted: &ExtractedData,
        requested: Option<&[String]>,
    ) -> veil_types::Result<(Vec<Entity>, RedactionMapping)> {
        if self.config.endpoint.is_none() {
            debug!("LLM engine has no endpoint configured, returning empty results");
            return Ok((Vec::new(), RedactionMapping::default()));
        }
        let labels = self.labels(requested);
        if labels.is_empty() {
            let mut status = self.status.lock().await;
            status.failed_calls += 1;
            return Ok((Vec::new(), RedactionMapping::default()));
        }

        let minimized = minimize_extracted_data(extracted.clone(), &MinimizationConfig::default());
        let mut all_entities = Vec::new();
        let mut mapping = RedactionMapping::default();

        for page in &minimized.pages {
            let (full_text, offsets) = page.full_text_with_offsets();
            let spans = match self.query_page(&full_text, &labels).await {
                Ok(spans) => spans,
                Err(error) => {
                    warn!(page = page.page, error = %error, "LLM query failed, page yields no entities");
                    self.status.lock().await.failed_calls += 1;
                    mapping.pages.push(PageRedaction {
                        page: page.page,
                        sensitive: Vec::new(),
                    });
                    continue;
                }
            };

            let mut found = Vec::new();
            for span in spans {
                for (start, end) in Self::occurrences(&full_text, span.text.trim()) {
                    found.push(Entity {
                        entity_type: span.label.to_uppercase(),
                        start,
                        end,
                        score: LLM_SCORE,
                        original_text: span.text.trim().to_string(),
                    });
                }
            }
            let found = dedup_entities(found);

            let mut sensitive = Vec::new();
            for entity in &found {
                if let Some((processed, span)) =
                    process_single_entity(entity, &page.words, &offsets)
                {
                    all_entities.push(processed);
                    sensitive.push(span);
                }
            }
            mapping.pages.push(PageRedaction {
                page: page.page,
                sensitive,
            });
        }
        mapping.normalize();

        let mut status = self.status.lock().await;
        status.total_calls += 1;
        status.last_used = Some(Utc::now());
        Ok((all_entities, mapping))
    }

    async fn status(&self) -> DetectorStatus {
        self.status.lock().await.clone()
    }
}

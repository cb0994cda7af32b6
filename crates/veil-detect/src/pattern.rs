//! Rule-based detection engine.
//!
//! Always available: no model, no network, just compiled patterns for the
//! well-structured identifier shapes. Scores are fixed per rule and
//! reflect how unambiguous the shape is.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use veil_compliance::{minimize_extracted_data, MinimizationConfig};
use veil_types::{
    DetectorStatus, Entity, ExtractedData, PageRedaction, RedactionMapping,
};

use crate::base::{byte_to_char_offset, dedup_entities, process_single_entity};
use crate::EntityDetector;

struct PatternRule {
    label: &'static str,
    score: f64,
    pattern: &'static Lazy<Regex>,
}

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap());
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\d{2,3}[ \-]?\d{2}[ \-]?\d{2}[ \-]?\d{2,4}\b").unwrap());
static NATIONAL_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{6}\s?\d{5}\b").unwrap());
static CREDIT_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{4}[ \-]?){3}\d{4}\b").unwrap());
static IPV4: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static MAC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9A-Fa-f]{2}[:\-]){5}[0-9A-Fa-f]{2}\b").unwrap());

static RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        PatternRule { label: "EMAIL", score: 0.95, pattern: &EMAIL },
        PatternRule { label: "NATIONAL_ID", score: 0.90, pattern: &NATIONAL_ID },
        PatternRule { label: "CREDIT_CARD", score: 0.90, pattern: &CREDIT_CARD },
        PatternRule { label: "PHONE", score: 0.80, pattern: &PHONE },
        PatternRule { label: "IP_ADDRESS", score: 0.70, pattern: &IPV4 },
        PatternRule { label: "MAC_ADDRESS", score: 0.70, pattern: &MAC },
    ]
});

/// Regex-rule detection engine.
pub struct PatternDetector {
    status: Mutex<DetectorStatus>,
}

impl PatternDetector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(DetectorStatus {
                engine: "pattern".to_string(),
                initialized: true,
                model_available: true,
                initialization_time: Some(0.0),
                ..DetectorStatus::default()
            }),
        })
    }

    pub fn supported_entities() -> Vec<String> {
        RULES.iter().map(|r| r.label.to_string()).collect()
    }

    fn selected_rules(requested: Option<&[String]>) -> Vec<&'static PatternRule> {
        match requested {
            None => RULES.iter().collect(),
            Some(labels) => RULES
                .iter()
                .filter(|rule| {
                    labels.iter().any(|label| label.eq_ignore_ascii_case(rule.label))
                })
                .collect(),
        }
    }
}

#[async_trait]
impl EntityDetector for PatternDetector {
    fn engine_name(&self) -> &str {
        "pattern"
    }

    async fn detect_sensitive_data(
        &self,
        extracted: &ExtractedData,
        requested: Option<&[String]>,
    ) -> veil_types::Result<(Vec<Entity>, RedactionMapping)> {
        let minimized = minimize_extracted_data(extracted.clone(), &MinimizationConfig::default());
        let rules = Self::selected_rules(requested);
        if rules.is_empty() {
            warn!("No pattern rules match the requested entities");
            let mut status = self.status.lock().await;
            status.failed_calls += 1;
            return Ok((Vec::new(), RedactionMapping::default()));
        }

        let mut all_entities = Vec::new();
        let mut mapping = RedactionMapping::default();

        for page in &minimized.pages {
            let (full_text, offsets) = page.full_text_with_offsets();
            let mut found = Vec::new();
            for rule in &rules {
                for hit in rule.pattern.find_iter(&full_text) {
                    let start = byte_to_char_offset(&full_text, hit.start());
                    let end = byte_to_char_offset(&full_text, hit.end());
                    found.push(Entity {
                        entity_type: rule.label.to_string(),
                        start,
                        end,
                        score: rule.score,
                        original_text: hit.as_str().to_string(),
                    });
                }
            }
            let found = dedup_entities(found);
            debug!(page = page.page, hits = found.len(), "Pattern scan finished");

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

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::{BoundingBox, Page, Word};

    fn page_of(words: &[&str]) -> ExtractedData {
        let words = words
            .iter()
            .enumerate()
            .map(|(i, w)| Word::new(*w, BoundingBox::new(i as f64 * 100.0, 700.0, i as f64 * 100.0 + 80.0, 712.0)))
            .collect();
        ExtractedData {
            pages: vec![Page {
                page: 1,
                words,
                error: None,
            }],
            empty_pages: vec![],
            content_pages: 1,
            total_document_pages: 1,
            ..ExtractedData::default()
        }
    }

    #[tokio::test]
    async fn test_finds_email_and_national_id() {
        let detector = PatternDetector::new();
        let extracted = page_of(&["kontakt", "kari@example.no", "fnr", "12345678901"]);

        let (entities, mapping) = detector
            .detect_sensitive_data(&extracted, None)
            .await
            .unwrap();
        let types: Vec<&str> = entities.iter().map(|e| e.entity_type.as_str()).collect();
        assert!(types.contains(&"EMAIL"));
        assert!(types.contains(&"NATIONAL_ID"));
        assert_eq!(mapping.pages.len(), 1);
        assert_eq!(mapping.pages[0].sensitive.len(), entities.len());
    }

    #[tokio::test]
    async fn test_offsets_match_text() {
        let detector = PatternDetector::new();
        let extracted = page_of(&["mail:", "bjørn@example.no"]);
        let (entities, _) = detector
            .detect_sensitive_data(&extracted, None)
            .await
            .unwrap();
        assert_eq!(entities.len(), 1);
        let (full_text, _) = extracted.pages[0].full_text_with_offsets();
        let slice: String = full_text
            .chars()
            .skip(entities[0].start)
            .take(entities[0].end - entities[0].start)
            .collect();
        assert_eq!(slice, entities[0].original_text);
    }

    #[tokio::test]
    async fn test_requested_filter_narrows_rules() {
        let detector = PatternDetector::new();
        let extracted = page_of(&["kari@example.no", "12345678901"]);
        let requested = vec!["email".to_string()];
        let (entities, _) = detector
            .detect_sensitive_data(&extracted, Some(&requested))
            .await
            .unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_type, "EMAIL");
    }

    #[tokio::test]
    async fn test_unknown_requested_yields_empty() {
        let detector = PatternDetector::new();
        let extracted = page_of(&["kari@example.no"]);
        let requested = vec!["PASSPORT".to_string()];
        let (entities, mapping) = detector
            .detect_sensitive_data(&extracted, Some(&requested))
            .await
            .unwrap();
        assert!(entities.is_empty());
        assert!(mapping.pages.is_empty());
    }
}

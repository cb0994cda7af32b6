//! Hybrid orchestrator: runs every configured engine in parallel and
//! reconciles their results.
//!
//! A failing or timed-out engine is reported in its outcome and excluded
//! from the merge; the rest proceed. Within a merged page no cross-engine
//! order is promised beyond the stable (start, entity_type) sort.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{info, warn};
use veil_sync::with_lock_context;
use veil_types::{
    DetectorStatus, Entity, ExtractedData, PageRedaction, RedactionMapping, SensitiveSpan,
};

use crate::EntityDetector;

/// Budget for one engine inside the hybrid run.
const ENGINE_TIMEOUT: Duration = Duration::from_secs(120);

/// What happened to one engine during a hybrid run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOutcome {
    pub engine: String,
    pub success: bool,
    pub entity_count: usize,
    pub time_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs up to four engines concurrently and merges their findings.
pub struct HybridDetector {
    detectors: Vec<Arc<dyn EntityDetector>>,
}

impl HybridDetector {
    pub fn new(detectors: Vec<Arc<dyn EntityDetector>>) -> Arc<Self> {
        Arc::new(Self { detectors })
    }

    pub fn engine_count(&self) -> usize {
        self.detectors.len()
    }

    /// Full hybrid run: merged results plus the per-engine outcome list.
    pub async fn detect_with_outcomes(
        &self,
        extracted: &ExtractedData,
        requested: Option<&[String]>,
    ) -> ((Vec<Entity>, RedactionMapping), Vec<EngineOutcome>) {
        if self.detectors.is_empty() {
            return ((Vec::new(), RedactionMapping::default()), Vec::new());
        }

        let shared = Arc::new(extracted.clone());
        let requested: Arc<Option<Vec<String>>> = Arc::new(requested.map(|r| r.to_vec()));

        let mut handles = Vec::with_capacity(self.detectors.len());
        for detector in &self.detectors {
            let detector = detector.clone();
            let extracted = shared.clone();
            let requested = requested.clone();
            let engine = detector.engine_name().to_string();
            // One lock-holder context per engine task.
            let handle = tokio::spawn(with_lock_context(async move {
                let started = Instant::now();
                let outcome = timeout(
                    ENGINE_TIMEOUT,
                    detector.detect_sensitive_data(&extracted, (*requested).as_deref()),
                )
                .await;
                (outcome, started.elapsed())
            }));
            handles.push((engine, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut combined_entities = Vec::new();
        let mut merged_pages: BTreeMap<u32, Vec<SensitiveSpan>> = BTreeMap::new();

        for (engine, handle) in handles {
            match handle.await {
                Ok((Ok(Ok((entities, mapping))), elapsed)) => {
                    for page in mapping.pages {
                        merged_pages
                            .entry(page.page)
                            .or_default()
                            .extend(page.sensitive);
                    }
                    outcomes.push(EngineOutcome {
                        engine,
                        success: true,
                        entity_count: entities.len(),
                        time_secs: elapsed.as_secs_f64(),
                        error: None,
                    });
                    combined_entities.extend(entities);
                }
                Ok((Ok(Err(error)), elapsed)) => {
                    warn!(engine = %engine, error = %error, "Engine failed during hybrid run");
                    outcomes.push(EngineOutcome {
                        engine,
                        success: false,
                        entity_count: 0,
                        time_secs: elapsed.as_secs_f64(),
                        error: Some(error.to_string()),
                    });
                }
                Ok((Err(_), elapsed)) => {
                    warn!(engine = %engine, "Engine timed out during hybrid run");
                    outcomes.push(EngineOutcome {
                        engine,
                        success: false,
                        entity_count: 0,
                        time_secs: elapsed.as_secs_f64(),
                        error: Some(format!(
                            "timed out after {}s",
                            ENGINE_TIMEOUT.as_secs()
                        )),
                    });
                }
                Err(join_error) => {
                    warn!(engine = %engine, error = %join_error, "Engine task aborted during hybrid run");
                    outcomes.push(EngineOutcome {
                        engine,
                        success: false,
                        entity_count: 0,
                        time_secs: 0.0,
                        error: Some(join_error.to_string()),
                    });
                }
            }
        }

        let mut mapping = RedactionMapping {
            pages: merged_pages
                .into_iter()
                .map(|(page, sensitive)| PageRedaction { page, sensitive })
                .collect(),
        };
        mapping.normalize();

        info!(
            engines = outcomes.len(),
            successful = outcomes.iter().filter(|o| o.success).count(),
            entities = combined_entities.len(),
            "Hybrid detection merged"
        );
        ((combined_entities, mapping), outcomes)
    }
}

#[async_trait]
impl EntityDetector for HybridDetector {
    fn engine_name(&self) -> &str {
        "hybrid"
    }

    async fn detect_sensitive_data(
        &self,
        extracted: &ExtractedData,
        requested: Option<&[String]>,
    ) -> veil_types::Result<(Vec<Entity>, RedactionMapping)> {
        let (merged, _) = self.detect_with_outcomes(extracted, requested).await;
        Ok(merged)
    }

    async fn status(&self) -> DetectorStatus {
        let mut status = DetectorStatus {
            engine: "hybrid".to_string(),
            ..DetectorStatus::default()
        };
        for detector in &self.detectors {
            let inner = detector.status().await;
            status.initialized |= inner.initialized;
            status.model_available |= inner.model_available;
            status.total_calls += inner.total_calls;
            status.failed_calls += inner.failed_calls;
            if inner.last_used > status.last_used {
                status.last_used = inner.last_used;
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::BoundingBox;

    struct FixedDetector {
        name: String,
        entities: Vec<Entity>,
        page: u32,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl EntityDetector for FixedDetector {
        fn engine_name(&self) -> &str {
            &self.name
        }

        async fn detect_sensitive_data(
            &self,
            _extracted: &ExtractedData,
            _requested: Option<&[String]>,
        ) -> veil_types::Result<(Vec<Entity>, RedactionMapping)> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(veil_types::VeilError::detection(&self.name, "boom"));
            }
            let sensitive = self
                .entities
                .iter()
                .map(|e| SensitiveSpan {
                    entity_type: e.entity_type.clone(),
                    score: e.score,
                    bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                    start: e.start,
                    end: e.end,
                    original_text: Some(e.original_text.clone()),
                })
                .collect();
            Ok((
                self.entities.clone(),
                RedactionMapping {
                    pages: vec![PageRedaction {
                        page: self.page,
                        sensitive,
                    }],
                },
            ))
        }

        async fn status(&self) -> DetectorStatus {
            DetectorStatus {
                engine: self.name.clone(),
                initialized: true,
                ..DetectorStatus::default()
            }
        }
    }

    fn entity(ty: &str, start: usize) -> Entity {
        Entity {
            entity_type: ty.to_string(),
            start,
            end: start + 4,
            score: 0.9,
            original_text: "text".to_string(),
        }
    }

    fn fixed(name: &str, page: u32, entities: Vec<Entity>) -> Arc<dyn EntityDetector> {
        Arc::new(FixedDetector {
            name: name.to_string(),
            entities,
            page,
            fail: false,
            delay: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_merges_entities_across_engines() {
        let hybrid = HybridDetector::new(vec![
            fixed("a", 1, vec![entity("EMAIL", 0)]),
            fixed("b", 1, vec![entity("PERSON", 10), entity("PHONE", 5)]),
        ]);
        let ((entities, mapping), outcomes) = hybrid
            .detect_with_outcomes(&ExtractedData::default(), None)
            .await;

        // Union of engine counts equals the merged count when all succeed.
        assert_eq!(entities.len(), 3);
        assert_eq!(outcomes.iter().map(|o| o.entity_count).sum::<usize>(), 3);
        assert!(outcomes.iter().all(|o| o.success));

        // One merged page, spans sorted by start.
        assert_eq!(mapping.pages.len(), 1);
        let starts: Vec<usize> = mapping.pages[0].sensitive.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0, 5, 10]);
    }

    #[tokio::test]
    async fn test_failed_engine_excluded_from_merge() {
        let failing = Arc::new(FixedDetector {
            name: "bad".to_string(),
            entities: vec![entity("X", 0)],
            page: 1,
            fail: true,
            delay: Duration::ZERO,
        });
        let hybrid = HybridDetector::new(vec![fixed("good", 2, vec![entity("EMAIL", 0)]), failing]);

        let ((entities, mapping), outcomes) = hybrid
            .detect_with_outcomes(&ExtractedData::default(), None)
            .await;
        assert_eq!(entities.len(), 1);
        assert_eq!(mapping.pages.len(), 1);
        assert_eq!(mapping.pages[0].page, 2);

        let bad = outcomes.iter().find(|o| o.engine == "bad").unwrap();
        assert!(!bad.success);
        assert!(bad.error.as_deref().unwrap().contains("boom"));
        assert!(outcomes.iter().any(|o| o.engine == "good" && o.success));
    }

    #[tokio::test]
    async fn test_no_engines_returns_empty() {
        let hybrid = HybridDetector::new(vec![]);
        let ((entities, mapping), outcomes) = hybrid
            .detect_with_outcomes(&ExtractedData::default(), None)
            .await;
        assert!(entities.is_empty());
        assert!(mapping.pages.is_empty());
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_pages_merge_across_engines() {
        let hybrid = HybridDetector::new(vec![
            fixed("a", 3, vec![entity("EMAIL", 2)]),
            fixed("b", 1, vec![entity("PERSON", 0)]),
            fixed("c", 3, vec![entity("PHONE", 0)]),
        ]);
        let ((_, mapping), _) = hybrid
            .detect_with_outcomes(&ExtractedData::default(), None)
            .await;
        let pages: Vec<u32> = mapping.pages.iter().map(|p| p.page).collect();
        assert_eq!(pages, vec![1, 3]);
        assert_eq!(mapping.pages[1].sensitive.len(), 2);
    }
}

//! Entity detection for the Veil service.
//!
//! Every engine implements [`EntityDetector`]; the hybrid orchestrator
//! holds a slice of them and merges their results. The generic span-model
//! detector carries the heavy machinery: singleton model lifecycle with a
//! process-wide model cache, sentence chunking, per-page fan-out and a
//! result cache. The pattern engine is rule-based and always available;
//! the LLM engine talks to a remote completion endpoint.

pub mod base;
pub mod chunking;
mod engine;
mod hybrid;
mod llm;
mod model;
mod pattern;
mod pronouns;

use async_trait::async_trait;
pub use engine::{SpanEngineSpec, SpanModelDetector};
pub use hybrid::{EngineOutcome, HybridDetector};
pub use llm::{LlmConfig, LlmDetector};
pub use model::{CachedModel, MockSpanModel, ModelCache, ModelKey, RemoteSpanModel, SpanModel};
pub use pattern::PatternDetector;
pub use pronouns::filter_pronoun_false_positives;

use veil_types::{DetectorStatus, Entity, ExtractedData, RedactionMapping};

/// A detection engine: takes minimized extracted text, returns entities
/// with page-offset coordinates plus a redaction mapping.
#[async_trait]
pub trait EntityDetector: Send + Sync {
    fn engine_name(&self) -> &str;

    /// Runs detection over all pages. `requested` narrows the entity types;
    /// `None` means the engine's defaults. Failures inside a single page or
    /// engine degrade to empty results rather than errors.
    async fn detect_sensitive_data(
        &self,
        extracted: &ExtractedData,
        requested: Option<&[String]>,
    ) -> veil_types::Result<(Vec<Entity>, RedactionMapping)>;

    async fn status(&self) -> DetectorStatus;
}

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;
use tracing::debug;
use veil_types::ExtractedData;

/// Controls how much of an extraction survives minimization.
#[derive(Debug, Clone)]
pub struct MinimizationConfig {
    /// Metadata keys allowed through; everything else is dropped.
    pub metadata_whitelist: Vec<String>,
    /// When true, words are reduced to text and position only. The typed
    /// word model is already positional, so this is recorded for the
    /// minimization trail and enforced on any loose metadata.
    pub required_fields_only: bool,
}

impl Default for MinimizationConfig {
    fn default() -> Self {
        Self {
            metadata_whitelist: vec!["document_id".to_string(), "filename".to_string()],
            required_fields_only: true,
        }
    }
}

/// Fields every minimized word retains.
const WORD_REQUIRED_FIELDS: [&str; 5] = ["text", "x0", "y0", "x1", "y1"];

/// Strips an extraction down to what detection actually needs.
///
/// Words that trim to nothing are dropped; a page left without words moves
/// to `empty_pages`. Metadata is reduced to the whitelist and a
/// `_minimization_meta` entry records what was applied. The page-count
/// invariant (`pages + empty_pages == total_document_pages`) is preserved.
pub fn minimize_extracted_data(
    mut data: ExtractedData,
    config: &MinimizationConfig,
) -> ExtractedData {
    let mut kept_pages = Vec::with_capacity(data.pages.len());
    for mut page in data.pages {
        page.words.retain(|w| !w.text.trim().is_empty());
        if page.words.is_empty() {
            if !data.empty_pages.contains(&page.page) {
                data.empty_pages.push(page.page);
            }
        } else {
            kept_pages.push(page);
        }
    }
    data.empty_pages.sort_unstable();
    data.pages = kept_pages;
    data.content_pages = data.pages.len();

    let mut metadata: BTreeMap<String, serde_json::Value> = data
        .metadata
        .into_iter()
        .filter(|(key, _)| config.metadata_whitelist.iter().any(|allowed| allowed == key))
        .collect();
    metadata.insert(
        "_minimization_meta".to_string(),
        json!({
            "applied_at": Utc::now().to_rfc3339(),
            "required_fields_only": config.required_fields_only,
            "fields_retained": WORD_REQUIRED_FIELDS,
        }),
    );
    data.metadata = metadata;

    debug!(
        pages = data.content_pages,
        empty_pages = data.empty_pages.len(),
        "Extraction minimized"
    );
    data
}

//! Normalization shared by every detection engine: raw spans become typed
//! entities, character offsets become composite bounding boxes, and scores
//! are filtered uniformly.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};
use veil_types::{
    BoundingBox, Entity, RawSpan, SensitiveSpan, VeilError, Word, WordOffset,
};

/// Converts a regex-style byte offset into a character offset.
pub fn byte_to_char_offset(text: &str, byte_offset: usize) -> usize {
    text[..byte_offset.min(text.len())].chars().count()
}

/// Slice of `text` by character offsets.
pub fn char_slice(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end.saturating_sub(start)).collect()
}

/// Standardizes one engine-native span against the page text it was
/// detected in. `base_offset` shifts chunk-relative offsets to page
/// coordinates. Returns `None` when the offsets cannot be reconciled with
/// the text.
pub fn standardize_raw_span(raw: &RawSpan, full_text: &str, base_offset: usize) -> Option<Entity> {
    let start = base_offset + raw.start;
    let end = base_offset + raw.end;
    let text_len = full_text.chars().count();
    if start >= end || end > text_len {
        debug!(label = %raw.label, start, end, text_len, "Dropping span with invalid offsets");
        return None;
    }
    let original_text = char_slice(full_text, start, end);
    if original_text.trim().is_empty() {
        return None;
    }
    Some(Entity {
        entity_type: raw.label.clone(),
        start,
        end,
        score: raw.score.clamp(0.0, 1.0),
        original_text,
    })
}

/// Union of the boxes of all words whose character range intersects
/// `[start, end)`. `None` when no word intersects.
pub fn composite_bbox(
    start: usize,
    end: usize,
    words: &[Word],
    offsets: &[WordOffset],
) -> Option<BoundingBox> {
    let boxes: Vec<BoundingBox> = offsets
        .iter()
        .filter(|o| o.start < end && start < o.end)
        .filter_map(|o| words.get(o.word_index).map(|w| w.bbox))
        .collect();
    BoundingBox::union_all(boxes.iter())
}

/// Maps one entity onto the page geometry. Returns the processed entity
/// plus its redaction span, or `None` (logged) when no geometry matches.
pub fn process_single_entity(
    entity: &Entity,
    words: &[Word],
    offsets: &[WordOffset],
) -> Option<(Entity, SensitiveSpan)> {
    match composite_bbox(entity.start, entity.end, words, offsets) {
        Some(bbox) => Some((
            entity.clone(),
            SensitiveSpan {
                entity_type: entity.entity_type.clone(),
                score: entity.score,
                bbox,
                start: entity.start,
                end: entity.end,
                original_text: Some(entity.original_text.clone()),
            },
        )),
        None => {
            warn!(
                entity_type = %entity.entity_type,
                start = entity.start,
                end = entity.end,
                "Entity maps to no words, dropping"
            );
            None
        }
    }
}

/// Removes duplicate spans, keyed by `(entity_type, start, end)`, keeping
/// the highest score. First-seen order is preserved.
pub fn dedup_entities(entities: Vec<Entity>) -> Vec<Entity> {
    let mut seen: HashMap<(String, usize, usize), usize> = HashMap::new();
    let mut out: Vec<Entity> = Vec::with_capacity(entities.len());
    for entity in entities {
        let key = (entity.entity_type.clone(), entity.start, entity.end);
        match seen.get(&key) {
            Some(&index) => {
                if entity.score > out[index].score {
                    out[index] = entity;
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(entity);
            }
        }
    }
    out
}

/// Keeps entities whose score is at least `min_score`.
pub fn filter_entities_by_score(entities: Vec<Entity>, min_score: f64) -> Vec<Entity> {
    entities.into_iter().filter(|e| e.score >= min_score).collect()
}

/// Score filter over either supported JSON shape: a flat entity array or a
/// `{pages: [{sensitive: [...]}]}` mapping. Any other top-level shape is an
/// error. Applying it twice is a no-op.
pub fn filter_by_score(value: Value, min_score: f64) -> veil_types::Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .filter(|item| score_of(item) >= min_score)
                .collect(),
        )),
        Value::Object(mut map) => {
            let Some(Value::Array(pages)) = map.remove("pages") else {
                return Err(VeilError::validation(
                    "score filter expects an entity list or a pages mapping",
                ));
            };
            let filtered: Vec<Value> = pages
                .into_iter()
                .map(|mut page| {
                    if let Some(Value::Array(sensitive)) =
                        page.get_mut("sensitive").map(Value::take)
                    {
                        page["sensitive"] = Value::Array(
                            sensitive
                                .into_iter()
                                .filter(|item| score_of(item) >= min_score)
                                .collect(),
                        );
                    }
                    page
                })
                .collect();
            map.insert("pages".to_string(), Value::Array(filtered));
            Ok(Value::Object(map))
        }
        _ => Err(VeilError::validation(
            "score filter expects an entity list or a pages mapping",
        )),
    }
}

fn score_of(item: &Value) -> f64 {
    item.get("score").and_then(Value::as_f64).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn word(text: &str, x0: f64) -> Word {
        Word::new(text, BoundingBox::new(x0, 700.0, x0 + 30.0, 712.0))
    }

    fn page_fixture() -> (String, Vec<Word>, Vec<WordOffset>) {
        let words = vec![word("John", 100.0), word("Doe", 140.0), word("here", 180.0)];
        // "John Doe here"
        let offsets = vec![
            WordOffset { word_index: 0, start: 0, end: 4 },
            WordOffset { word_index: 1, start: 5, end: 8 },
            WordOffset { word_index: 2, start: 9, end: 13 },
        ];
        ("John Doe here".to_string(), words, offsets)
    }

    #[test]
    fn test_standardize_recovers_original_text() {
        let raw = RawSpan {
            label: "PERSON".into(),
            start: 0,
            end: 8,
            score: 1.4,
            text: "John Doe".into(),
        };
        let entity = standardize_raw_span(&raw, "John Doe here", 0).unwrap();
        assert_eq!(entity.original_text, "John Doe");
        assert_eq!(entity.score, 1.0);

        let bad = RawSpan { start: 10, end: 50, ..raw };
        assert!(standardize_raw_span(&bad, "John Doe here", 0).is_none());
    }

    #[test]
    fn test_standardize_applies_chunk_offset() {
        let full = "intro. John Doe here";
        let raw = RawSpan {
            label: "PERSON".into(),
            start: 0,
            end: 8,
            score: 0.8,
            text: "John Doe".into(),
        };
        let entity = standardize_raw_span(&raw, full, 7).unwrap();
        assert_eq!(entity.start, 7);
        assert_eq!(entity.end, 15);
        assert_eq!(entity.original_text, "John Doe");
    }

    #[test]
    fn test_composite_bbox_unions_intersecting_words() {
        let (_, words, offsets) = page_fixture();
        // "John Doe" covers the first two words.
        let bbox = composite_bbox(0, 8, &words, &offsets).unwrap();
        assert_eq!(bbox, BoundingBox::new(100.0, 700.0, 170.0, 712.0));
        // A span entirely inside the gap maps to nothing.
        assert!(composite_bbox(4, 5, &words, &offsets).is_none());
    }

    #[test]
    fn test_process_single_entity_produces_span() {
        let (text, words, offsets) = page_fixture();
        let entity = Entity {
            entity_type: "PERSON".into(),
            start: 0,
            end: 8,
            score: 0.9,
            original_text: char_slice(&text, 0, 8),
        };
        let (processed, span) = process_single_entity(&entity, &words, &offsets).unwrap();
        assert_eq!(processed.original_text, "John Doe");
        assert_eq!(span.bbox.x0, 100.0);
        assert_eq!(span.original_text.as_deref(), Some("John Doe"));
    }

    #[test]
    fn test_dedup_keeps_highest_score() {
        let mk = |score: f64| Entity {
            entity_type: "PERSON".into(),
            start: 0,
            end: 4,
            score,
            original_text: "John".into(),
        };
        let out = dedup_entities(vec![mk(0.5), mk(0.9), mk(0.7)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn test_filter_by_score_flat_list() {
        let value = json!([{"score": 0.9}, {"score": 0.5}]);
        let out = filter_by_score(value, 0.85).unwrap();
        assert_eq!(out, json!([{"score": 0.9}]));
        // Idempotent.
        let again = filter_by_score(out.clone(), 0.85).unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn test_filter_by_score_mapping() {
        let value = json!({"pages": [{"page": 1, "sensitive": [{"score": 0.3}, {"score": 0.95}]}]});
        let out = filter_by_score(value, 0.5).unwrap();
        assert_eq!(out["pages"][0]["sensitive"], json!([{"score": 0.95}]));
    }

    #[test]
    fn test_filter_by_score_rejects_bad_shape() {
        assert!(filter_by_score(json!("nope"), 0.5).is_err());
        assert!(filter_by_score(json!({"entities": []}), 0.5).is_err());
    }

    #[test]
    fn test_byte_to_char_offset_multibyte() {
        let text = "bjørn er her";
        let byte = text.find("er").unwrap();
        assert_eq!(byte_to_char_offset(text, byte), 6);
    }
}

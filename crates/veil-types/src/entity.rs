use serde::{Deserialize, Serialize};

/// A detected span of sensitive information.
///
/// `start` and `end` are character offsets into the reconstructed full text
/// of the page the entity was found on, with `start < end`. `score` is in
/// `[0, 1]` and monotone with respect to detector confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
    pub score: f64,
    pub original_text: String,
}

impl Entity {
    /// True when the offsets are well-formed against `full_text`.
    pub fn offsets_valid(&self, full_text: &str) -> bool {
        self.start < self.end && self.end <= full_text.chars().count()
    }
}

/// Engine-native detection output before normalization: label plus offsets
/// relative to whatever chunk of text the engine was handed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSpan {
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub score: f64,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_valid() {
        let e = Entity {
            entity_type: "PERSON".into(),
            start: 0,
            end: 4,
            score: 0.9,
            original_text: "John".into(),
        };
        assert!(e.offsets_valid("John lives here"));
        assert!(!e.offsets_valid("Jo"));

        let inverted = Entity { start: 4, end: 4, ..e };
        assert!(!inverted.offsets_valid("John lives here"));
    }
}

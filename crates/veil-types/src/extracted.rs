use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::redaction::BoundingBox;

/// One positioned word as extracted from a PDF page.
///
/// `text` is non-empty after trimming; words that trim to nothing are
/// discarded during extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

impl Word {
    pub fn new(text: impl Into<String>, bbox: BoundingBox) -> Self {
        Self {
            text: text.into(),
            bbox,
        }
    }
}

/// One extracted page: 1-based number plus its ordered words.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub words: Vec<Word>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Page {
    /// Reconstructs the page's full text (words joined by single spaces)
    /// together with the character range each word occupies in it.
    pub fn full_text_with_offsets(&self) -> (String, Vec<WordOffset>) {
        let mut text = String::new();
        let mut offsets = Vec::with_capacity(self.words.len());
        for (idx, word) in self.words.iter().enumerate() {
            if idx > 0 {
                text.push(' ');
            }
            let start = text.chars().count();
            text.push_str(&word.text);
            let end = start + word.text.chars().count();
            offsets.push(WordOffset {
                word_index: idx,
                start,
                end,
            });
        }
        (text, offsets)
    }
}

/// Character range a word occupies within its page's reconstructed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordOffset {
    pub word_index: usize,
    pub start: usize,
    pub end: usize,
}

/// Extraction result for a whole document.
///
/// Invariant: `pages.len() + empty_pages.len() == total_document_pages`, and
/// every page in `pages` carries at least one word.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedData {
    pub pages: Vec<Page>,
    /// 1-based indices of pages with no extractable text.
    pub empty_pages: Vec<u32>,
    pub content_pages: usize,
    pub total_document_pages: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

impl ExtractedData {
    /// Checks the page-count invariant.
    pub fn is_consistent(&self) -> bool {
        self.pages.len() + self.empty_pages.len() == self.total_document_pages
            && self.pages.iter().all(|p| !p.words.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str) -> Word {
        Word::new(text, BoundingBox::new(0.0, 0.0, 10.0, 12.0))
    }

    #[test]
    fn test_full_text_offsets_align_with_words() {
        let page = Page {
            page: 1,
            words: vec![word("John"), word("lives"), word("here")],
            error: None,
        };
        let (text, offsets) = page.full_text_with_offsets();
        assert_eq!(text, "John lives here");
        assert_eq!(offsets.len(), 3);
        for (w, off) in page.words.iter().zip(&offsets) {
            let slice: String = text
                .chars()
                .skip(off.start)
                .take(off.end - off.start)
                .collect();
            assert_eq!(slice, w.text);
        }
    }

    #[test]
    fn test_empty_page_has_empty_text() {
        let page = Page {
            page: 1,
            words: vec![],
            error: None,
        };
        let (text, offsets) = page.full_text_with_offsets();
        assert!(text.is_empty());
        assert!(offsets.is_empty());
    }

    #[test]
    fn test_consistency_invariant() {
        let data = ExtractedData {
            pages: vec![Page {
                page: 1,
                words: vec![word("x")],
                error: None,
            }],
            empty_pages: vec![2, 3],
            content_pages: 1,
            total_document_pages: 3,
            ..Default::default()
        };
        assert!(data.is_consistent());

        let broken = ExtractedData {
            total_document_pages: 5,
            ..data
        };
        assert!(!broken.is_consistent());
    }
}

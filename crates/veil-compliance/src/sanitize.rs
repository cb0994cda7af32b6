use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Metadata keys that identify people or tooling and are always neutralized.
const IDENTIFYING_FIELDS: [&str; 8] = [
    "author",
    "creator",
    "producer",
    "keywords",
    "title",
    "subject",
    "creation_date",
    "modification_date",
];

const PLACEHOLDER: &str = "[redacted]";

static SENSITIVE_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "email",
            Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap(),
        ),
        (
            "phone",
            Regex::new(r"(?:\+?\d{1,3}[ \-]?)?(?:\d[ \-]?){7,14}\d").unwrap(),
        ),
        // Norwegian national identity number shape: 11 digits.
        ("national_id", Regex::new(r"\b\d{11}\b").unwrap()),
        (
            "mac",
            Regex::new(r"\b(?:[0-9A-Fa-f]{2}[:\-]){5}[0-9A-Fa-f]{2}\b").unwrap(),
        ),
        (
            "ip",
            Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
        ),
    ]
});

/// Options for [`sanitize_document_metadata`].
#[derive(Debug, Clone, Default)]
pub struct SanitizeOptions {
    /// Keys left untouched even by pattern scrubbing.
    pub preserve_fields: Vec<String>,
    /// Apply the sensitive-value regexes to every remaining string field.
    pub apply_patterns: bool,
}

/// Neutralizes identifying metadata fields and, optionally, scrubs
/// sensitive-looking values from all other string fields.
pub fn sanitize_document_metadata(
    mut metadata: BTreeMap<String, Value>,
    options: &SanitizeOptions,
) -> BTreeMap<String, Value> {
    for (key, value) in metadata.iter_mut() {
        let lowered = key.to_ascii_lowercase();
        if options.preserve_fields.iter().any(|p| p == key) {
            continue;
        }
        if IDENTIFYING_FIELDS.contains(&lowered.as_str()) {
            *value = Value::String(String::new());
            continue;
        }
        if options.apply_patterns {
            if let Value::String(s) = value {
                *s = scrub_patterns(s);
            }
        }
    }
    metadata
}

fn scrub_patterns(input: &str) -> String {
    let mut out = input.to_string();
    for (_, pattern) in SENSITIVE_PATTERNS.iter() {
        out = pattern.replace_all(&out, PLACEHOLDER).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_identifying_fields_cleared() {
        let out = sanitize_document_metadata(
            meta(&[("author", "Kari Nordmann"), ("title", "Internal memo"), ("pages", "4")]),
            &SanitizeOptions::default(),
        );
        assert_eq!(out["author"], json!(""));
        assert_eq!(out["title"], json!(""));
        assert_eq!(out["pages"], json!("4"));
    }

    #[test]
    fn test_pattern_scrubbing() {
        let out = sanitize_document_metadata(
            meta(&[("note", "reach me at kari@example.no or 192.168.1.10")]),
            &SanitizeOptions {
                preserve_fields: vec![],
                apply_patterns: true,
            },
        );
        let note = out["note"].as_str().unwrap();
        assert!(!note.contains("kari@example.no"));
        assert!(!note.contains("192.168.1.10"));
        assert!(note.contains("[redacted]"));
    }

    #[test]
    fn test_preserved_fields_untouched() {
        let out = sanitize_document_metadata(
            meta(&[("filename", "report_12345678901.pdf")]),
            &SanitizeOptions {
                preserve_fields: vec!["filename".to_string()],
                apply_patterns: true,
            },
        );
        assert_eq!(out["filename"], json!("report_12345678901.pdf"));
    }

    #[test]
    fn test_national_id_scrubbed() {
        let out = sanitize_document_metadata(
            meta(&[("comment", "fnr 12345678901 attached")]),
            &SanitizeOptions {
                preserve_fields: vec![],
                apply_patterns: true,
            },
        );
        assert!(!out["comment"].as_str().unwrap().contains("12345678901"));
    }
}

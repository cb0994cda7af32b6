//! PDF extraction and redaction for the Veil service.
//!
//! Extraction walks each page's content stream, tracking the text matrix
//! to position every word; redaction rewrites the same streams, removing
//! the operators that show redacted strings and painting opaque boxes over
//! the sensitive regions. Both run under a per-document instance lock so a
//! document is never processed concurrently.

mod config;
pub mod content;
mod extractor;
mod redactor;

pub use config::PdfConfig;
pub use extractor::{PageImage, PdfExtractor};
pub use redactor::PdfRedactor;

//! Data-minimization and retention duties of the Veil service.
//!
//! Everything here exists to keep the service from holding or emitting more
//! personal data than an operation needs: extracted text is stripped to its
//! positional essentials, document metadata is scrubbed of identifying
//! fields, and the only durable trace of processing is an append-only
//! record log with a bounded retention window.

mod minimize;
mod records;
mod sanitize;

pub use minimize::{minimize_extracted_data, MinimizationConfig};
pub use records::{RecordKeeper, RecordStats, RecordsConfig};
pub use sanitize::{sanitize_document_metadata, SanitizeOptions};

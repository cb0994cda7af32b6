//! Shared data model for the Veil detection and redaction pipeline.
//!
//! Every type that crosses a crate boundary lives here: extracted text with
//! positions, detected entities, redaction mappings, and the shared error
//! kinds. Types are plain serde structs so they can travel over the HTTP
//! boundary unchanged.

mod entity;
mod errors;
mod extracted;
mod redaction;
mod status;

pub use entity::{Entity, RawSpan};
pub use errors::VeilError;
pub use extracted::{ExtractedData, Page, Word, WordOffset};
pub use redaction::{BoundingBox, PageRedaction, RedactionMapping, SensitiveSpan};
pub use status::DetectorStatus;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, VeilError>;

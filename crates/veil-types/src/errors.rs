use thiserror::Error;

/// Error kinds recognized across the Veil core.
///
/// Each variant maps to a distinct recovery policy: validation errors reach
/// the client as 4xx, resource exhaustion degrades to partial results,
/// detection failures collapse to empty results for the failing unit, and
/// persistence failures surface a synthetic reference id instead of the raw
/// message.
#[derive(Error, Debug)]
pub enum VeilError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("lock '{name}' acquisition timed out after {timeout_secs}s")]
    LockTimeout { name: String, timeout_secs: u64 },

    #[error("operation '{operation}' timed out")]
    Timeout { operation: String },

    #[error("memory pressure: {message}")]
    MemoryPressure { message: String },

    #[error("detector '{engine}' unavailable: {message}")]
    DetectorUnavailable { engine: String, message: String },

    #[error("detection failed in '{engine}': {message}")]
    Detection { engine: String, message: String },

    #[error("PDF processing failed: {message}")]
    Pdf { message: String },

    #[error("cache operation failed: {message}")]
    Cache { message: String },

    #[error("record keeping failed: {message}")]
    Records { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl VeilError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn detection(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Detection {
            engine: engine.into(),
            message: message.into(),
        }
    }

    pub fn pdf(message: impl Into<String>) -> Self {
        Self::Pdf {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind, used by the API error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Timeout { .. } => "timeout",
            Self::MemoryPressure { .. } => "memory_pressure",
            Self::DetectorUnavailable { .. } => "detector_unavailable",
            Self::Detection { .. } => "detection",
            Self::Pdf { .. } => "pdf",
            Self::Cache { .. } => "cache",
            Self::Records { .. } => "records",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }
}

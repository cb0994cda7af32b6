use std::time::Duration;

use serde::{Deserialize, Serialize};

/// PDF processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfConfig {
    /// Maximum PDF size accepted (in bytes).
    pub max_size_bytes: u64,

    /// Documents with more pages than this are processed in batches.
    pub batch_threshold: usize,

    /// Pages per extraction batch.
    pub page_batch_size: usize,

    /// Soft budget per page; exceeding it logs a warning.
    pub page_time_budget: Duration,

    /// Budget per batch; exceeding it abandons the rest of that batch.
    pub batch_time_budget: Duration,

    /// Budget for taking the per-document instance lock.
    pub lock_timeout: Duration,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * 1024 * 1024,
            batch_threshold: 10,
            page_batch_size: 20,
            page_time_budget: Duration::from_secs(5),
            batch_time_budget: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(60),
        }
    }
}

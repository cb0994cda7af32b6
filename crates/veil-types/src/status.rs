use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time status of one detection engine.
///
/// Created once per detector singleton and mutated only under the
/// detector's instance lock; handlers receive cloned snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorStatus {
    pub engine: String,
    pub initialized: bool,
    /// Seconds the last successful initialization took.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialization_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub model_available: bool,
    pub model_directory_exists: bool,
}

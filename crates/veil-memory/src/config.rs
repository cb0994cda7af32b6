use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the memory monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Regular cleanup threshold as a percentage of total system memory.
    pub memory_threshold: f64,
    /// Emergency cleanup threshold.
    pub critical_threshold: f64,
    /// Threshold used by batch scheduling to shrink worker counts.
    pub batch_memory_threshold: f64,
    /// Sampling interval for the background task.
    pub check_interval: Duration,
    /// Recompute thresholds from live system state every ~60 samples.
    pub adaptive_thresholds: bool,
    /// Minimum spacing between cleanup passes.
    pub min_cleanup_interval: Duration,
    /// Disables the background task entirely when false.
    pub enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_threshold: 80.0,
            critical_threshold: 90.0,
            batch_memory_threshold: 70.0,
            check_interval: Duration::from_secs(5),
            adaptive_thresholds: true,
            min_cleanup_interval: Duration::from_secs(30),
            enabled: true,
        }
    }
}

impl MemoryConfig {
    /// Reads overrides from the environment. Recognized names follow the
    /// service's deployment contract (`MEMORY_THRESHOLD`,
    /// `CRITICAL_MEMORY_THRESHOLD`, `MEMORY_CHECK_INTERVAL`,
    /// `ENABLE_MEMORY_MONITORING`, `ADAPTIVE_MEMORY_THRESHOLDS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_f64("MEMORY_THRESHOLD") {
            config.memory_threshold = v;
        }
        if let Some(v) = env_f64("CRITICAL_MEMORY_THRESHOLD") {
            config.critical_threshold = v;
        }
        if let Some(v) = env_f64("MEMORY_CHECK_INTERVAL") {
            config.check_interval = Duration::from_secs_f64(v.max(1.0));
        }
        if let Some(v) = env_bool("ENABLE_MEMORY_MONITORING") {
            config.enabled = v;
        }
        if let Some(v) = env_bool("ADAPTIVE_MEMORY_THRESHOLDS") {
            config.adaptive_thresholds = v;
        }
        config
    }
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

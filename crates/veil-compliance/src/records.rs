use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use veil_types::VeilError;

const RECORD_FILE_PREFIX: &str = "processing_record_";
const RECORD_FILE_SUFFIX: &str = ".jsonl";
const LEGAL_BASIS: &str = "legitimate_interests";

/// Configuration for the processing-record log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsConfig {
    pub records_dir: PathBuf,
    pub retention_days: u32,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            records_dir: PathBuf::from("logs/processing_records"),
            retention_days: 90,
        }
    }
}

/// One processing event, one JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub timestamp: String,
    pub operation_type: String,
    pub document_type: String,
    pub entity_types: Vec<String>,
    pub processing_time_seconds: f64,
    pub file_count: usize,
    pub entity_count: usize,
    pub success: bool,
    pub legal_basis: String,
    pub operation_id: String,
}

/// In-memory totals over the surviving record files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordStats {
    pub total_records: u64,
    pub failed_records: u64,
    pub by_operation: BTreeMap<String, u64>,
}

/// Append-only processing-record log, bucketed per UTC date, with
/// background retention cleanup.
pub struct RecordKeeper {
    config: RecordsConfig,
    /// Serializes appenders; OS append semantics keep lines whole across
    /// processes, this mutex keeps them whole across tasks.
    state: Mutex<RecordStats>,
}

impl RecordKeeper {
    pub async fn new(config: RecordsConfig) -> Result<Arc<Self>, VeilError> {
        tokio::fs::create_dir_all(&config.records_dir)
            .await
            .map_err(|e| VeilError::Records {
                message: format!("cannot create records dir: {e}"),
            })?;
        let keeper = Arc::new(Self {
            config,
            state: Mutex::new(RecordStats::default()),
        });
        keeper.recount().await?;
        Ok(keeper)
    }

    /// Spawns the retention sweep: once now, then daily.
    pub fn start_retention_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let keeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(24 * 60 * 60));
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.cleanup_expired().await {
                    error!(error = %e, "Retention cleanup failed");
                }
            }
        })
    }

    /// Appends one record and updates the in-memory counters.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_processing(
        &self,
        operation_type: &str,
        document_type: &str,
        entity_types: Vec<String>,
        processing_time: f64,
        file_count: usize,
        entity_count: usize,
        success: bool,
    ) -> Result<String, VeilError> {
        let now = Utc::now();
        let timestamp = now.to_rfc3339();
        let operation_id = operation_id(&timestamp, operation_type, document_type);
        let record = ProcessingRecord {
            timestamp,
            operation_type: operation_type.to_string(),
            document_type: document_type.to_string(),
            entity_types,
            processing_time_seconds: (processing_time * 1000.0).round() / 1000.0,
            file_count,
            entity_count,
            success,
            legal_basis: LEGAL_BASIS.to_string(),
            operation_id: operation_id.clone(),
        };

        let path = self.file_for_date(now.date_naive());
        let line = serde_json::to_string(&record).map_err(|e| VeilError::Records {
            message: format!("record serialization failed: {e}"),
        })?;

        let mut state = self.state.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| VeilError::Records {
                message: format!("cannot open record file: {e}"),
            })?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| VeilError::Records {
                message: format!("record append failed: {e}"),
            })?;

        state.total_records += 1;
        if !success {
            state.failed_records += 1;
        }
        *state
            .by_operation
            .entry(operation_type.to_string())
            .or_default() += 1;

        debug!(operation_id = %operation_id, operation = operation_type, "Processing record written");
        Ok(operation_id)
    }

    /// Snapshot of the counters; callers get their own copy.
    pub async fn stats(&self) -> RecordStats {
        self.state.lock().await.clone()
    }

    /// Deletes record files older than the retention window, then rebuilds
    /// the counters from what survived.
    pub async fn cleanup_expired(&self) -> Result<usize, VeilError> {
        let cutoff = Utc::now().date_naive() - chrono::Days::new(self.config.retention_days as u64);
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.config.records_dir)
            .await
            .map_err(|e| VeilError::Records {
                message: format!("cannot list records dir: {e}"),
            })?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let Some(date) = record_file_date(&name.to_string_lossy()) else {
                continue;
            };
            if date < cutoff {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        removed += 1;
                        info!(file = %entry.path().display(), "Removed expired record file");
                    }
                    Err(e) => warn!(file = %entry.path().display(), error = %e, "Could not remove record file"),
                }
            }
        }
        if removed > 0 {
            self.recount().await?;
        }
        Ok(removed)
    }

    /// Rebuilds the in-memory totals from the surviving files.
    async fn recount(&self) -> Result<(), VeilError> {
        let mut fresh = RecordStats::default();
        let mut dir = tokio::fs::read_dir(&self.config.records_dir)
            .await
            .map_err(|e| VeilError::Records {
                message: format!("cannot list records dir: {e}"),
            })?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            if record_file_date(&entry.file_name().to_string_lossy()).is_none() {
                continue;
            }
            let Ok(contents) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<ProcessingRecord>(line) {
                    Ok(record) => {
                        fresh.total_records += 1;
                        if !record.success {
                            fresh.failed_records += 1;
                        }
                        *fresh.by_operation.entry(record.operation_type).or_default() += 1;
                    }
                    Err(e) => {
                        warn!(file = %entry.path().display(), error = %e, "Skipping malformed record line")
                    }
                }
            }
        }
        *self.state.lock().await = fresh;
        Ok(())
    }

    fn file_for_date(&self, date: NaiveDate) -> PathBuf {
        self.config.records_dir.join(format!(
            "{RECORD_FILE_PREFIX}{}{RECORD_FILE_SUFFIX}",
            date.format("%Y-%m-%d")
        ))
    }
}

/// Stable operation id: first 16 hex chars of
/// sha256(timestamp|operation|document).
pub fn operation_id(timestamp: &str, operation_type: &str, document_type: &str) -> String {
    let digest = Sha256::digest(format!("{timestamp}_{operation_type}_{document_type}").as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn record_file_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name
        .strip_prefix(RECORD_FILE_PREFIX)?
        .strip_suffix(RECORD_FILE_SUFFIX)?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn keeper_in(dir: &TempDir, retention_days: u32) -> Arc<RecordKeeper> {
        RecordKeeper::new(RecordsConfig {
            records_dir: dir.path().to_path_buf(),
            retention_days,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_record_appends_jsonl_line() {
        let dir = TempDir::new().unwrap();
        let keeper = keeper_in(&dir, 90).await;
        let id = keeper
            .record_processing("detection", "PDF", vec!["PERSON".into()], 1.234, 1, 3, true)
            .await
            .unwrap();
        assert_eq!(id.len(), 16);

        let file = dir
            .path()
            .join(format!(
                "processing_record_{}.jsonl",
                Utc::now().format("%Y-%m-%d")
            ));
        let contents = std::fs::read_to_string(file).unwrap();
        let record: ProcessingRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(record.operation_type, "detection");
        assert_eq!(record.legal_basis, "legitimate_interests");
        assert_eq!(record.entity_count, 3);
    }

    #[tokio::test]
    async fn test_stats_track_failures_and_operations() {
        let dir = TempDir::new().unwrap();
        let keeper = keeper_in(&dir, 90).await;
        keeper
            .record_processing("detection", "PDF", vec![], 0.1, 1, 0, true)
            .await
            .unwrap();
        keeper
            .record_processing("redaction", "PDF", vec![], 0.2, 1, 0, false)
            .await
            .unwrap();
        let stats = keeper.stats().await;
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.failed_records, 1);
        assert_eq!(stats.by_operation["detection"], 1);
    }

    #[tokio::test]
    async fn test_retention_removes_old_files_and_recounts() {
        let dir = TempDir::new().unwrap();
        // A file from well beyond the retention window.
        let old = dir.path().join("processing_record_2020-01-01.jsonl");
        std::fs::write(
            &old,
            r#"{"timestamp":"2020-01-01T00:00:00+00:00","operation_type":"detection","document_type":"PDF","entity_types":[],"processing_time_seconds":0.1,"file_count":1,"entity_count":0,"success":true,"legal_basis":"legitimate_interests","operation_id":"aaaaaaaaaaaaaaaa"}
"#,
        )
        .unwrap();

        let keeper = keeper_in(&dir, 30).await;
        assert_eq!(keeper.stats().await.total_records, 1);

        let removed = keeper.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        // Totals match the (now empty) surviving set.
        assert_eq!(keeper.stats().await.total_records, 0);
    }

    #[tokio::test]
    async fn test_unrelated_files_survive_cleanup() {
        let dir = TempDir::new().unwrap();
        let other = dir.path().join("notes.txt");
        std::fs::write(&other, "keep me").unwrap();
        let keeper = keeper_in(&dir, 1).await;
        keeper.cleanup_expired().await.unwrap();
        assert!(other.exists());
    }

    #[test]
    fn test_operation_id_is_stable() {
        let a = operation_id("t", "op", "doc");
        let b = operation_id("t", "op", "doc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, operation_id("t2", "op", "doc"));
    }
}

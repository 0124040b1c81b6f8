//! File-backed job table.
//!
//! - The file is the single source of truth for every submitted batch
//! - Saves replace the whole table atomically; the previous table is kept as a backup
//! - A missing file is an empty table; an unreadable one is fatal
//! - One writer process is assumed, so load-mutate-save is cooperative, not locked

use crate::models::{BatchError, JobRecord, JobTable, Result};
use crate::store::write_atomic;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Job store backed by a single JSON file.
#[derive(Debug, Clone)]
pub struct JobStore {
    /// Path to the job table
    path: PathBuf,
    /// Copy of the table as it was before the last save
    backup_path: PathBuf,
}

impl JobStore {
    /// Create a store for the given file. Nothing is read until `load`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch_jobs".to_string());
        let backup_path = path.with_file_name(format!("{stem}.backup.json"));
        Self { path, backup_path }
    }

    /// Path to the job table file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole table.
    pub fn load(&self) -> Result<JobTable> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(JobTable::new()),
            Err(e) => {
                return Err(BatchError::StoreCorruption {
                    path: self.path.clone(),
                    message: e.to_string(),
                });
            }
        };

        serde_json::from_str(&content).map_err(|e| BatchError::StoreCorruption {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Save the whole table (atomic write).
    pub fn save(&self, jobs: &JobTable) -> Result<()> {
        let content = serde_json::to_string_pretty(jobs)
            .map_err(|e| BatchError::Internal(format!("Serializing job table: {e}")))?;

        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| BatchError::io("backing up job table", e))?;
        }

        write_atomic(&self.path, content.as_bytes())?;
        debug!(path = %self.path.display(), jobs = jobs.len(), "Job table saved");
        Ok(())
    }

    /// Insert or replace one record and persist immediately.
    pub fn upsert(&self, batch_id: &str, record: JobRecord) -> Result<()> {
        self.update(|jobs| {
            jobs.insert(batch_id.to_string(), record);
            Ok(())
        })
    }

    /// Load, mutate and save as one logical step.
    ///
    /// Nothing is written if the closure fails.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut JobTable) -> Result<T>) -> Result<T> {
        let mut jobs = self.load()?;
        let out = mutate(&mut jobs)?;
        self.save(&jobs)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, ProviderKind};
    use tempfile::TempDir;

    fn record(model: &str) -> JobRecord {
        JobRecord::pending(
            ProviderKind::Google,
            model,
            PathBuf::from("raw_outputs/run_a"),
            Some(PathBuf::from("raw_outputs/run_a/batch_input_x.jsonl")),
        )
    }

    #[test]
    fn missing_file_loads_as_empty_table() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("batch_jobs.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("batch_jobs.json"));

        let mut jobs = JobTable::new();
        jobs.insert("batches/abc".to_string(), record("gemini"));
        let mut done = record("gpt");
        done.provider = ProviderKind::OpenAi;
        done.mark_completed("batch_1", PathBuf::from("r.jsonl")).unwrap();
        done.mark_processed("batch_1").unwrap();
        jobs.insert("batch_1".to_string(), done);

        store.save(&jobs).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, jobs);

        let first = fs::read(store.path()).unwrap();
        store.save(&loaded).unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), first);
    }

    #[test]
    fn loads_table_written_with_naive_timestamps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_jobs.json");
        fs::write(
            &path,
            r#"{"msgbatch_01": {"provider": "anthropic", "model_key": "claude", "status": "pending", "timestamp": "2025-06-01T14:03:22.512345", "output_dir": "raw_outputs/run_20250601_140322_claude"}}"#,
        )
        .unwrap();

        let store = JobStore::new(&path);
        let jobs = store.load().unwrap();
        assert_eq!(jobs["msgbatch_01"].model_key, "claude");
        assert_eq!(jobs["msgbatch_01"].status, JobStatus::Pending);

        store.save(&jobs).unwrap();
        assert_eq!(store.load().unwrap(), jobs);
    }

    #[test]
    fn upsert_keeps_existing_records() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("jobs").join("batch_jobs.json"));

        store.upsert("a", record("m1")).unwrap();
        store.upsert("b", record("m2")).unwrap();

        let jobs = store.load().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs["a"].model_key, "m1");
        assert_eq!(jobs["b"].status, JobStatus::Pending);
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_jobs.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JobStore::new(&path).load().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn failed_update_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("batch_jobs.json"));
        store.upsert("a", record("m1")).unwrap();
        let before = fs::read(store.path()).unwrap();

        let result: Result<()> = store.update(|jobs| {
            jobs.clear();
            Err(BatchError::Internal("abort".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn previous_table_is_backed_up() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("batch_jobs.json"));
        store.upsert("a", record("m1")).unwrap();
        store.upsert("b", record("m2")).unwrap();

        let backup = dir.path().join("batch_jobs.backup.json");
        let backed_up: JobTable =
            serde_json::from_str(&fs::read_to_string(backup).unwrap()).unwrap();
        assert_eq!(backed_up.len(), 1);
    }
}

//! Submission dispatcher.
//!
//! Fans one payload set out to several models. Each model is independent:
//! a failed submission is logged and reported, and the loop moves on. A
//! successful submission is persisted before the next model is attempted,
//! so an interrupted run never loses a batch the provider already accepted.

use crate::models::{BatchError, Config, JobRecord, Payload, Result};
use crate::pipeline::with_deadline;
use crate::provider::{AdapterResolver, sanitize_id};
use crate::store::{JobStore, write_atomic};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// A batch the provider accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBatch {
    pub model_key: String,
    pub batch_id: String,
    pub output_dir: PathBuf,
}

/// A model whose submission failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSubmission {
    pub model_key: String,
    pub error: String,
}

/// Outcome of one dispatch call.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub submitted: Vec<SubmittedBatch>,
    pub failed: Vec<FailedSubmission>,
}

/// Routes payloads to each requested model's adapter.
pub struct SubmissionDispatcher<'a> {
    store: &'a JobStore,
    resolver: &'a dyn AdapterResolver,
    /// Root under which per-run directories are created
    output_root: PathBuf,
    call_timeout: Duration,
    /// (file name, contents) copied into every run directory
    snapshots: Vec<(String, String)>,
}

impl<'a> SubmissionDispatcher<'a> {
    pub fn new(
        store: &'a JobStore,
        resolver: &'a dyn AdapterResolver,
        output_root: impl Into<PathBuf>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            output_root: output_root.into(),
            call_timeout,
            snapshots: Vec::new(),
        }
    }

    /// Build a dispatcher from configuration, snapshotting it into each run directory.
    pub fn from_config(
        store: &'a JobStore,
        resolver: &'a dyn AdapterResolver,
        config: &Config,
    ) -> Result<Self> {
        let snapshot = toml::to_string_pretty(config)
            .map_err(|e| BatchError::Internal(format!("Serializing config snapshot: {e}")))?;
        Ok(Self::new(
            store,
            resolver,
            config.output_dir.clone(),
            Duration::from_secs(config.batch.call_timeout_secs),
        )
        .with_snapshot("config_snapshot.toml", snapshot))
    }

    /// Copy `contents` into every run directory as `file_name`.
    pub fn with_snapshot(mut self, file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.snapshots.push((file_name.into(), contents.into()));
        self
    }

    /// Submit `payloads` once per model key.
    ///
    /// Only a job store failure aborts the loop.
    pub async fn dispatch(
        &self,
        model_keys: &[String],
        payloads: &[Payload],
    ) -> Result<DispatchReport> {
        if payloads.is_empty() {
            return Err(BatchError::InvalidInput("no payloads to submit".to_string()));
        }

        let mut report = DispatchReport::default();

        for model_key in model_keys {
            info!(model = %model_key, payloads = payloads.len(), "Submitting batch");

            let (batch_id, record) = match self.submit_one(model_key, payloads).await {
                Ok(submitted) => submitted,
                Err(e) => {
                    warn!(model = %model_key, error = %e, "Batch submission failed");
                    report.failed.push(FailedSubmission {
                        model_key: model_key.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let output_dir = record.output_dir.clone();
            self.store.upsert(&batch_id, record)?;
            info!(model = %model_key, batch_id = %batch_id, "Batch recorded");

            report.submitted.push(SubmittedBatch {
                model_key: model_key.clone(),
                batch_id,
                output_dir,
            });
        }

        Ok(report)
    }

    async fn submit_one(
        &self,
        model_key: &str,
        payloads: &[Payload],
    ) -> Result<(String, JobRecord)> {
        let adapter = self.resolver.resolve(model_key)?;
        let output_dir = self.prepare_output_dir(model_key)?;

        let submission =
            with_deadline(self.call_timeout, adapter.submit(payloads, &output_dir)).await?;

        let record = JobRecord::pending(
            adapter.kind(),
            model_key,
            output_dir,
            Some(submission.input_file),
        );
        Ok((submission.batch_id, record))
    }

    /// Create `<root>/run_<timestamp>_<model>` and write the snapshots.
    ///
    /// The stamp has millisecond precision; a directory that already exists
    /// gets a numeric suffix so two runs never share output.
    fn prepare_output_dir(&self, model_key: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_root)
            .map_err(|e| BatchError::io("creating output root", e))?;

        let base = format!(
            "run_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S_%3f"),
            sanitize_id(model_key)
        );
        let dir = unique_dir(&self.output_root, &base)?;

        for (file_name, contents) in &self.snapshots {
            write_atomic(&dir.join(file_name), contents.as_bytes())?;
        }
        Ok(dir)
    }
}

/// Create and return the first of `root/base`, `root/base_2`, `root/base_3`, ... that does not exist yet.
fn unique_dir(root: &Path, base: &str) -> Result<PathBuf> {
    let mut n = 1u32;
    loop {
        let name = if n == 1 { base.to_string() } else { format!("{base}_{n}") };
        let dir = root.join(name);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(BatchError::io(format!("creating {}", dir.display()), e)),
        }
    }
}

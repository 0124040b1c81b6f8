//! Status poller.
//!
//! Checks every non-terminal job concurrently, bounded by a semaphore, and
//! downloads results for jobs the provider reports as finished. Outcomes
//! are applied to the job table one at a time by the calling task, which
//! persists after every state change. A poll or download that errors leaves
//! its record untouched so the next pass retries it.

use crate::models::{BatchError, JobStatus, JobTable, Result};
use crate::pipeline::{progress_bar, with_deadline};
use crate::provider::{AdapterResolver, ProviderAdapter};
use crate::store::JobStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Per-job error collected during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub batch_id: String,
    pub model_key: String,
    pub error: String,
}

/// Outcome of one polling pass.
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    /// Non-terminal jobs looked at
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: Vec<JobError>,
}

/// What one job's check produced.
enum PollOutcome {
    Pending { native: String },
    Completed { native: String, result_file: PathBuf },
    Failed { native: String },
}

pub struct Poller<'a> {
    store: &'a JobStore,
    resolver: &'a dyn AdapterResolver,
    concurrency: usize,
    call_timeout: Duration,
}

impl<'a> Poller<'a> {
    pub fn new(
        store: &'a JobStore,
        resolver: &'a dyn AdapterResolver,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    /// Check every Pending job once.
    ///
    /// Returns an error only when the job store cannot be read or written.
    pub async fn poll_pending(&self) -> Result<PollReport> {
        let mut jobs = self.store.load()?;
        let pending: Vec<(String, String, PathBuf)> = jobs
            .iter()
            .filter(|(_, job)| !job.status.is_terminal())
            .map(|(id, job)| (id.clone(), job.model_key.clone(), job.output_dir.clone()))
            .collect();

        let mut report = PollReport {
            checked: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            info!("No pending batches");
            return Ok(report);
        }

        info!(
            pending = pending.len(),
            concurrency = self.concurrency,
            "Polling batches"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(pending.len());

        for (batch_id, model_key, output_dir) in pending {
            let adapter = match self.resolver.resolve(&model_key) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(batch_id = %batch_id, model = %model_key, error = %e, "Cannot resolve adapter");
                    report.still_pending += 1;
                    report.errors.push(JobError {
                        batch_id,
                        model_key,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let semaphore = Arc::clone(&semaphore);
            let deadline = self.call_timeout;

            let task_batch_id = batch_id.clone();
            let handle = tokio::spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => check_job(adapter, &task_batch_id, output_dir, deadline).await,
                    Err(e) => Err(BatchError::Internal(format!("Poll semaphore closed: {e}"))),
                }
            });
            handles.push((batch_id, model_key, handle));
        }

        let pb = progress_bar(handles.len() as u64);

        for (batch_id, model_key, handle) in handles {
            let outcome = handle
                .await
                .unwrap_or_else(|e| Err(BatchError::Internal(format!("Poll task panicked: {e}"))));
            self.apply(&mut jobs, &mut report, batch_id, model_key, outcome)?;
            pb.inc(1);
        }

        pb.finish_with_message(format!(
            "{} completed, {} failed, {} pending",
            report.completed, report.failed, report.still_pending
        ));

        info!(
            completed = report.completed,
            failed = report.failed,
            pending = report.still_pending,
            errors = report.errors.len(),
            "Polling pass finished"
        );
        Ok(report)
    }

    /// Apply one outcome to the table and persist it when the record changed.
    fn apply(
        &self,
        jobs: &mut JobTable,
        report: &mut PollReport,
        batch_id: String,
        model_key: String,
        outcome: Result<PollOutcome>,
    ) -> Result<()> {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(batch_id = %batch_id, model = %model_key, error = %e, "Poll failed, will retry next pass");
                report.still_pending += 1;
                report.errors.push(JobError {
                    batch_id,
                    model_key,
                    error: e.to_string(),
                });
                return Ok(());
            }
        };

        let Some(job) = jobs.get_mut(&batch_id) else {
            debug!(batch_id = %batch_id, "Job vanished from table during poll");
            return Ok(());
        };

        match outcome {
            PollOutcome::Pending { native } => {
                info!(batch_id = %batch_id, model = %model_key, status = %native, "Batch still running");
                report.still_pending += 1;
                if job.native_status.as_deref() == Some(native.as_str()) {
                    return Ok(());
                }
                job.observe_native_status(&native);
            }
            PollOutcome::Completed {
                native,
                result_file,
            } => {
                job.observe_native_status(&native);
                job.mark_completed(&batch_id, result_file.clone())?;
                info!(
                    batch_id = %batch_id,
                    model = %model_key,
                    result_file = %result_file.display(),
                    "Batch completed, results downloaded"
                );
                report.completed += 1;
            }
            PollOutcome::Failed { native } => {
                job.observe_native_status(&native);
                job.mark_failed(&batch_id, format!("provider reported '{native}'"))?;
                warn!(batch_id = %batch_id, model = %model_key, status = %native, "Batch failed on provider");
                report.failed += 1;
            }
        }

        self.store.save(jobs)
    }
}

/// Poll one batch and, if it finished, download its results.
async fn check_job(
    adapter: Arc<dyn ProviderAdapter>,
    batch_id: &str,
    output_dir: PathBuf,
    deadline: Duration,
) -> Result<PollOutcome> {
    let status = with_deadline(deadline, adapter.poll(batch_id)).await?;

    match status.status {
        JobStatus::Pending => Ok(PollOutcome::Pending {
            native: status.native,
        }),
        JobStatus::Failed => Ok(PollOutcome::Failed {
            native: status.native,
        }),
        JobStatus::Completed => {
            let result_file =
                with_deadline(deadline, adapter.fetch_result(batch_id, &output_dir)).await?;
            Ok(PollOutcome::Completed {
                native: status.native,
                result_file,
            })
        }
    }
}

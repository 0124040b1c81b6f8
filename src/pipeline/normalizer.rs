//! Result normalizer.
//!
//! Turns each Completed, unprocessed job's raw result file into canonical
//! records. Lines are joined to the submitted payloads by correlation id;
//! lines with no matching payload are dropped. A line whose text cannot be
//! extracted still produces a record, carrying `EXTRACTION_ERROR`.

use crate::models::{BatchError, CanonicalRecord, ExtractionError, JobRecord, Payload, Result};
use crate::provider::{AdapterResolver, ExtractedLine, ProviderAdapter};
use crate::pipeline::progress_bar;
use crate::store::{JobStore, write_atomic};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::JobError;

/// Substituted for generated and raw text when a line cannot be extracted.
pub const EXTRACTION_ERROR: &str = "[extraction error]";

/// Canonical output file name inside a run directory.
pub const SUMMARY_FILE: &str = "results_summary.json";

/// Per-line log file name inside a run directory.
pub const DETAILED_LOG_FILE: &str = "detailed_logs.jsonl";

/// Outcome of one normalization pass.
#[derive(Debug, Clone, Default)]
pub struct NormalizeReport {
    pub jobs_processed: usize,
    pub records_written: usize,
    /// Lines with no correlation id or an id outside the payload set
    pub unmatched_lines: usize,
    pub extraction_failures: usize,
    /// Completed jobs whose result file was not on disk
    pub skipped_missing_file: usize,
    pub errors: Vec<JobError>,
}

/// One line of `detailed_logs.jsonl`.
#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    id: &'a str,
    batch_id: &'a str,
    model: &'a str,
    user_query: &'a str,
    full_response: &'a str,
    extracted_query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    extraction_error: Option<String>,
}

/// Records and counters for one job's result file.
#[derive(Debug, Default)]
struct JobOutput {
    records: Vec<CanonicalRecord>,
    log_lines: Vec<String>,
    unmatched: usize,
    extraction_failures: usize,
}

pub struct ResultNormalizer<'a> {
    store: &'a JobStore,
    resolver: &'a dyn AdapterResolver,
}

impl<'a> ResultNormalizer<'a> {
    pub fn new(store: &'a JobStore, resolver: &'a dyn AdapterResolver) -> Self {
        Self { store, resolver }
    }

    /// Normalize every Completed job not yet processed.
    ///
    /// `payloads` is the submitted set results are joined against. Each
    /// job is marked processed and persisted as soon as its output is on
    /// disk, so an interrupted pass never repeats finished work.
    pub fn process_completed(&self, payloads: &[Payload]) -> Result<NormalizeReport> {
        let mut jobs = self.store.load()?;
        let by_id: HashMap<&str, &Payload> = payloads.iter().map(|p| (p.id.as_str(), p)).collect();

        let todo: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.awaiting_processing())
            .map(|(id, _)| id.clone())
            .collect();

        let mut report = NormalizeReport::default();
        if todo.is_empty() {
            info!("No completed batches awaiting processing");
            return Ok(report);
        }

        let pb = progress_bar(todo.len() as u64);

        for batch_id in todo {
            pb.inc(1);
            let Some(job) = jobs.get(&batch_id) else {
                continue;
            };

            let Some(result_file) = job.result_file.clone().filter(|p| p.exists()) else {
                warn!(
                    batch_id = %batch_id,
                    model = %job.model_key,
                    "Result file missing, skipping until it is downloaded again"
                );
                report.skipped_missing_file += 1;
                continue;
            };

            let output = match self.normalize_job(&batch_id, job, &result_file, &by_id) {
                Ok(output) => output,
                Err(e) => {
                    warn!(batch_id = %batch_id, model = %job.model_key, error = %e, "Normalization failed");
                    report.errors.push(JobError {
                        batch_id: batch_id.clone(),
                        model_key: job.model_key.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            info!(
                batch_id = %batch_id,
                model = %job.model_key,
                records = output.records.len(),
                unmatched = output.unmatched,
                extraction_failures = output.extraction_failures,
                "Batch normalized"
            );
            report.records_written += output.records.len();
            report.unmatched_lines += output.unmatched;
            report.extraction_failures += output.extraction_failures;

            if let Some(job) = jobs.get_mut(&batch_id) {
                job.mark_processed(&batch_id)?;
            }
            self.store.save(&jobs)?;
            report.jobs_processed += 1;
        }

        pb.finish_with_message(format!(
            "{} processed, {} records",
            report.jobs_processed, report.records_written
        ));
        Ok(report)
    }

    /// Read, join and write one job's output. Nothing in the store changes here.
    fn normalize_job(
        &self,
        batch_id: &str,
        job: &JobRecord,
        result_file: &Path,
        payloads: &HashMap<&str, &Payload>,
    ) -> Result<JobOutput> {
        let adapter = self.resolver.resolve(&job.model_key)?;
        let content = std::fs::read_to_string(result_file)
            .map_err(|e| BatchError::io(format!("reading {}", result_file.display()), e))?;

        let output = join_lines(adapter.as_ref(), batch_id, &job.model_key, &content, payloads)?;

        let summary = serde_json::to_string_pretty(&output.records)
            .map_err(|e| BatchError::Internal(format!("Serializing results: {e}")))?;
        write_atomic(&summary_path(&job.output_dir), summary.as_bytes())?;

        let mut log = output.log_lines.join("\n");
        if !log.is_empty() {
            log.push('\n');
        }
        write_atomic(&job.output_dir.join(DETAILED_LOG_FILE), log.as_bytes())?;

        Ok(output)
    }
}

/// Canonical output path for a run directory.
pub fn summary_path(output_dir: &Path) -> PathBuf {
    output_dir.join(SUMMARY_FILE)
}

/// Extract every line of a result file and join it to the payload set.
fn join_lines(
    adapter: &dyn ProviderAdapter,
    batch_id: &str,
    model_key: &str,
    content: &str,
    payloads: &HashMap<&str, &Payload>,
) -> Result<JobOutput> {
    let mut output = JobOutput::default();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let extracted = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => adapter.extract_text(&value),
            Err(e) => ExtractedLine::failed(None, ExtractionError::InvalidJson(e.to_string())),
        };

        let Some(custom_id) = extracted.custom_id else {
            if let Err(e) = &extracted.text {
                warn!(batch_id = %batch_id, line = line_no + 1, error = %e, "Unreadable result line");
                output.extraction_failures += 1;
            } else {
                debug!(batch_id = %batch_id, line = line_no + 1, "Result line has no correlation id");
                output.unmatched += 1;
            }
            continue;
        };

        let Some(payload) = payloads.get(custom_id.as_str()) else {
            debug!(batch_id = %batch_id, custom_id = %custom_id, "No payload for result line, dropped");
            output.unmatched += 1;
            continue;
        };

        let (generated_text, raw_response, extraction_error) = match extracted.text {
            Ok(text) => (clean_query(&text), text, None),
            Err(e) => {
                warn!(batch_id = %batch_id, custom_id = %custom_id, error = %e, "Extraction failed");
                output.extraction_failures += 1;
                (
                    EXTRACTION_ERROR.to_string(),
                    EXTRACTION_ERROR.to_string(),
                    Some(e.to_string()),
                )
            }
        };

        let entry = LogEntry {
            id: &custom_id,
            batch_id,
            model: model_key,
            user_query: &payload.user_query,
            full_response: &raw_response,
            extracted_query: &generated_text,
            extraction_error,
        };
        output.log_lines.push(
            serde_json::to_string(&entry)
                .map_err(|e| BatchError::Internal(format!("Serializing log entry: {e}")))?,
        );

        output.records.push(CanonicalRecord {
            id: custom_id,
            query: payload.user_query.clone(),
            model: model_key.to_string(),
            generated_text,
            ground_truth: payload.ground_truth.clone(),
            raw_response,
        });
    }

    Ok(output)
}

/// Reduce a model response to the query it contains.
///
/// Takes the first ```sparql block, else the first fenced block of any
/// language, else the whole response trimmed.
pub fn clean_query(text: &str) -> String {
    first_capture(r"(?is)```sparql\s*(.*?)```", text)
        .or_else(|| first_capture(r"(?s)```[A-Za-z0-9_-]*[ \t]*\n?(.*?)```", text))
        .unwrap_or_else(|| text.trim().to_string())
}

fn first_capture(pattern: &str, text: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    let m = re.captures(text)?.get(1)?;
    Some(m.as_str().trim().to_string())
}

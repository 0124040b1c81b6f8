//! Job records: one per submitted provider batch.
//!
//! Status only moves forward: Pending -> Completed or Pending -> Failed.
//! `result_file` is present exactly when the job is Completed, and
//! `results_processed` can only be set on a Completed job.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::{BatchError, Result};

/// Provider family a batch was submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Google,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Google => write!(f, "google"),
            ProviderKind::OpenAiCompatible => write!(f, "openai_compatible"),
        }
    }
}

/// Canonical batch status all provider-native states map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted, not yet finished on the provider side
    Pending,
    /// Finished and results downloaded
    Completed,
    /// Provider reported a terminal failure
    Failed,
}

impl JobStatus {
    /// Terminal states are never polled again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted state of one provider batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub provider: ProviderKind,
    pub model_key: String,
    pub status: JobStatus,
    #[serde(alias = "timestamp", deserialize_with = "utc_or_naive")]
    pub created_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_file: Option<PathBuf>,
    #[serde(default)]
    pub results_processed: bool,
    /// Last provider-native status observed by the poller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Accept RFC 3339 timestamps and offset-less ISO 8601 ones, read as UTC.
///
/// Older job tables stored local `isoformat()` times without an offset.
fn utc_or_naive<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{raw}': {e}")))
}

/// Batch identifier -> job record. Ordered so the store file is deterministic.
pub type JobTable = BTreeMap<String, JobRecord>;

impl JobRecord {
    /// Create a freshly submitted (Pending) record.
    pub fn pending(
        provider: ProviderKind,
        model_key: impl Into<String>,
        output_dir: PathBuf,
        input_file: Option<PathBuf>,
    ) -> Self {
        Self {
            provider,
            model_key: model_key.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            output_dir,
            input_file,
            result_file: None,
            results_processed: false,
            native_status: None,
            failure_reason: None,
        }
    }

    /// Record the provider-native status without changing canonical state.
    pub fn observe_native_status(&mut self, native: &str) {
        self.native_status = Some(native.to_string());
    }

    /// Pending -> Completed, attaching the downloaded result file.
    pub fn mark_completed(&mut self, batch_id: &str, result_file: PathBuf) -> Result<()> {
        self.ensure_pending(batch_id, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result_file = Some(result_file);
        Ok(())
    }

    /// Pending -> Failed.
    pub fn mark_failed(&mut self, batch_id: &str, reason: impl Into<String>) -> Result<()> {
        self.ensure_pending(batch_id, JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Flag a Completed job as normalized.
    ///
    /// K_i: only Completed jobs carry a result file, so only they can be processed.
    pub fn mark_processed(&mut self, batch_id: &str) -> Result<()> {
        if self.status != JobStatus::Completed {
            return Err(BatchError::InvalidTransition {
                batch_id: batch_id.to_string(),
                from: self.status.to_string(),
                to: "processed".to_string(),
            });
        }
        self.results_processed = true;
        Ok(())
    }

    /// Whether the normalizer still has work to do for this job.
    pub fn awaiting_processing(&self) -> bool {
        self.status == JobStatus::Completed && !self.results_processed
    }

    fn ensure_pending(&self, batch_id: &str, to: JobStatus) -> Result<()> {
        if self.status == JobStatus::Pending {
            Ok(())
        } else {
            Err(BatchError::InvalidTransition {
                batch_id: batch_id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::pending(
            ProviderKind::OpenAi,
            "gpt",
            PathBuf::from("out/run_1"),
            Some(PathBuf::from("out/run_1/batch_input_gpt.jsonl")),
        )
    }

    #[test]
    fn completed_never_regresses() {
        let mut job = record();
        job.mark_completed("b1", PathBuf::from("out/r.jsonl")).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result_file.is_some());

        assert!(job.mark_failed("b1", "late failure").is_err());
        assert!(job.mark_completed("b1", PathBuf::from("other")).is_err());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_file, Some(PathBuf::from("out/r.jsonl")));
    }

    #[test]
    fn failed_is_terminal_and_has_no_result_file() {
        let mut job = record();
        job.mark_failed("b1", "expired").unwrap();
        assert!(job.status.is_terminal());
        assert!(job.result_file.is_none());
        assert_eq!(job.failure_reason.as_deref(), Some("expired"));
        assert!(job.mark_completed("b1", PathBuf::from("r")).is_err());
    }

    #[test]
    fn only_completed_jobs_can_be_processed() {
        let mut job = record();
        assert!(job.mark_processed("b1").is_err());
        assert!(!job.results_processed);

        job.mark_completed("b1", PathBuf::from("r")).unwrap();
        assert!(job.awaiting_processing());
        job.mark_processed("b1").unwrap();
        assert!(!job.awaiting_processing());
    }

    #[test]
    fn loads_legacy_records() {
        let json = r#"{
            "provider": "anthropic",
            "model_key": "claude",
            "status": "pending",
            "timestamp": "2025-06-01T14:03:22.512345",
            "output_dir": "raw_outputs/run_x"
        }"#;
        let job: JobRecord = serde_json::from_str(json).unwrap();
        assert_eq!(
            job.created_at.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            "2025-06-01 14:03:22.512345"
        );
        assert_eq!(job.provider, ProviderKind::Anthropic);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.input_file.is_none());
        assert!(!job.results_processed);
    }

    #[test]
    fn timestamps_accept_offsets_and_reject_garbage() {
        let base = r#"{"provider":"openai","model_key":"gpt","status":"pending","output_dir":"o","#;
        let with_offset: JobRecord =
            serde_json::from_str(&format!(r#"{base}"created_at":"2025-06-01T16:03:22+02:00"}}"#))
                .unwrap();
        assert_eq!(with_offset.created_at.to_rfc3339(), "2025-06-01T14:03:22+00:00");

        let seconds_only: JobRecord =
            serde_json::from_str(&format!(r#"{base}"timestamp":"2025-06-01T14:03:22"}}"#)).unwrap();
        assert_eq!(seconds_only.created_at.timestamp(), with_offset.created_at.timestamp());

        assert!(serde_json::from_str::<JobRecord>(&format!(r#"{base}"timestamp":"yesterday"}}"#)).is_err());
    }

    #[test]
    fn provider_names_match_config_vocabulary() {
        for (kind, name) in [
            (ProviderKind::OpenAi, "\"openai\""),
            (ProviderKind::Anthropic, "\"anthropic\""),
            (ProviderKind::Google, "\"google\""),
            (ProviderKind::OpenAiCompatible, "\"openai_compatible\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), name);
        }
    }
}

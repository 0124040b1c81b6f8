//! Provider batch adapters.
//!
//! Each provider's batch API differs in how requests are encoded, how a batch
//! is created, what its status vocabulary is and where the generated text
//! sits in a result line. `ProviderAdapter` hides all of that; no other
//! module knows a provider's wire format.

mod anthropic;
mod google;
mod http;
mod openai;
mod registry;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use http::HttpTransport;
pub use openai::OpenAiAdapter;
pub use registry::ProviderRegistry;

use crate::models::{BatchError, ExtractionError, JobStatus, Payload, ProviderKind, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Provider-issued batch identifier
    pub batch_id: String,
    /// Request file written for this batch
    pub input_file: PathBuf,
}

/// Status reported by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollStatus {
    /// Canonical state
    pub status: JobStatus,
    /// Provider-native status text, kept for logs and failure reasons
    pub native: String,
}

/// What could be pulled out of one result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLine {
    /// Correlation id, if the line carries one
    pub custom_id: Option<String>,
    /// Generated text, or why it could not be extracted
    pub text: std::result::Result<String, ExtractionError>,
}

impl ExtractedLine {
    pub fn ok(custom_id: Option<String>, text: String) -> Self {
        Self {
            custom_id,
            text: Ok(text),
        }
    }

    pub fn failed(custom_id: Option<String>, error: ExtractionError) -> Self {
        Self {
            custom_id,
            text: Err(error),
        }
    }
}

/// Uniform capability set over one provider's batch protocol.
///
/// Adapters hold credentials and model settings but no job state; every call
/// is keyed by the batch id and is safe to repeat.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider family handled by this adapter.
    fn kind(&self) -> ProviderKind;

    /// Write the request file into `destination` and create the batch.
    async fn submit(&self, payloads: &[Payload], destination: &Path) -> Result<Submission>;

    /// Query the provider-native status and map it to the canonical state.
    async fn poll(&self, batch_id: &str) -> Result<PollStatus>;

    /// Download the raw result file into `destination`, overwriting any previous copy.
    async fn fetch_result(&self, batch_id: &str, destination: &Path) -> Result<PathBuf>;

    /// Pull the correlation id and generated text out of one result line.
    fn extract_text(&self, line: &serde_json::Value) -> ExtractedLine;
}

/// Resolves a logical model key to the adapter that serves it.
pub trait AdapterResolver: Send + Sync {
    fn resolve(&self, model_key: &str) -> Result<Arc<dyn ProviderAdapter>>;
}

/// Request file path for a model inside a run directory.
pub fn request_file_path(destination: &Path, model_key: &str) -> PathBuf {
    destination.join(format!("batch_input_{}.jsonl", sanitize_id(model_key)))
}

/// Result file path for a batch inside a run directory.
pub fn result_file_path(destination: &Path, batch_id: &str) -> PathBuf {
    destination.join(format!("batch_results_{}.jsonl", sanitize_id(batch_id)))
}

/// Make a provider id safe to use in a file name (Gemini ids contain '/').
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

/// Write records as line-delimited JSON, replacing any existing file.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BatchError::io("creating request directory", e))?;
    }
    let file = File::create(path).map_err(|e| BatchError::io("creating request file", e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| BatchError::Internal(format!("Serializing request: {e}")))?;
        writeln!(writer, "{line}").map_err(|e| BatchError::io("writing request file", e))?;
    }
    writer
        .flush()
        .map_err(|e| BatchError::io("flushing request file", e))
}

/// Walk a JSON value along object keys and array indices.
pub(crate) fn json_path<'a>(
    value: &'a serde_json::Value,
    path: &[PathStep],
) -> Option<&'a serde_json::Value> {
    path.iter().try_fold(value, |v, step| match step {
        PathStep::Key(k) => v.get(*k),
        PathStep::Index(i) => v.get(*i),
    })
}

/// One step of a `json_path` walk.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PathStep {
    Key(&'static str),
    Index(usize),
}

/// Read a string-or-number correlation field as a string.
pub(crate) fn correlation_id(line: &serde_json::Value, field: &str) -> Option<String> {
    match line.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gemini_ids_become_file_safe() {
        let path = result_file_path(Path::new("out"), "batches/abc123");
        assert_eq!(path, PathBuf::from("out/batch_results_batches_abc123.jsonl"));
    }

    #[test]
    fn json_path_walks_objects_and_arrays() {
        use PathStep::*;
        let v = json!({"a": [{"b": "hit"}]});
        assert_eq!(
            json_path(&v, &[Key("a"), Index(0), Key("b")]).and_then(|v| v.as_str()),
            Some("hit")
        );
        assert!(json_path(&v, &[Key("a"), Index(3)]).is_none());
        assert!(json_path(&v, &[Key("z")]).is_none());
    }

    #[test]
    fn numeric_correlation_ids_are_read_as_text() {
        assert_eq!(correlation_id(&json!({"custom_id": 12}), "custom_id").as_deref(), Some("12"));
        assert_eq!(correlation_id(&json!({"custom_id": "12"}), "custom_id").as_deref(), Some("12"));
        assert_eq!(correlation_id(&json!({"custom_id": null}), "custom_id"), None);
    }
}

//! Gemini batch adapter.
//!
//! The request file is uploaded through the resumable upload protocol and
//! referenced by `input_config.file_name` when the batch is created. Gemini
//! has no separate system slot in batch file requests, so the system prompt
//! and the user query are flattened into one text part.

use crate::models::{
    BatchError, ExtractionError, JobStatus, ModelSpec, Payload, ProviderError, ProviderKind,
    Result,
};
use crate::provider::{
    ExtractedLine, HttpTransport, PathStep, PollStatus, ProviderAdapter, Submission,
    correlation_id, json_path, request_file_path, result_file_path, write_jsonl,
};
use crate::store::write_atomic;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    key: &'a str,
    request: GenerateRequest,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: [Content; 1],
}

#[derive(Debug, Serialize)]
struct Content {
    parts: [TextPart; 1],
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

/// Flatten a payload into Gemini's single-text prompt form.
pub fn flatten_prompt(payload: &Payload) -> String {
    format!(
        "System: {}\n\nUser: {}",
        payload.system_prompt, payload.user_query
    )
}

/// Map a native batch state onto the canonical state.
///
/// Accepts both the `JOB_STATE_*` and `BATCH_STATE_*` vocabularies.
pub fn map_status(native: &str) -> JobStatus {
    let state = native
        .strip_prefix("JOB_STATE_")
        .or_else(|| native.strip_prefix("BATCH_STATE_"))
        .unwrap_or(native);

    match state {
        "SUCCEEDED" | "PARTIALLY_SUCCEEDED" => JobStatus::Completed,
        "FAILED" | "CANCELLED" | "EXPIRED" => JobStatus::Failed,
        "PENDING" | "QUEUED" | "RUNNING" | "UNSPECIFIED" | "PAUSED" | "CANCELLING"
        | "UPDATING" => JobStatus::Pending,
        _ => JobStatus::Pending,
    }
}

/// Adapter for the Gemini batch API.
pub struct GoogleAdapter {
    model_key: String,
    model_name: String,
    api_key: String,
    base_url: String,
    http: HttpTransport,
}

impl GoogleAdapter {
    /// Create an adapter for one configured model.
    pub fn new(
        model_key: &str,
        spec: &ModelSpec,
        api_key: String,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let base_url = spec
            .expanded_base_url()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model_name = spec
            .model_name
            .strip_prefix("models/")
            .unwrap_or(&spec.model_name)
            .to_string();

        Ok(Self {
            model_key: model_key.to_string(),
            model_name,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: HttpTransport::new("google", timeout_secs, max_retries)?,
        })
    }

    fn request_records<'a>(&self, payloads: &'a [Payload]) -> Vec<BatchRequest<'a>> {
        payloads
            .iter()
            .map(|p| BatchRequest {
                key: &p.id,
                request: GenerateRequest {
                    contents: [Content {
                        parts: [TextPart {
                            text: flatten_prompt(p),
                        }],
                    }],
                },
            })
            .collect()
    }

    /// Upload the request file, returning its `files/...` resource name.
    async fn upload(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path).map_err(|e| BatchError::io("reading request file", e))?;
        let display_name = format!("batch_input_{}", self.model_key);

        let start_url = format!("{}/upload/v1beta/files", self.base_url);
        let metadata = json!({ "file": { "display_name": display_name } });
        let start = self
            .http
            .send(|client| {
                Ok(client
                    .post(&start_url)
                    .header(API_KEY_HEADER, &self.api_key)
                    .header("X-Goog-Upload-Protocol", "resumable")
                    .header("X-Goog-Upload-Command", "start")
                    .header(
                        "X-Goog-Upload-Header-Content-Length",
                        bytes.len().to_string(),
                    )
                    .header("X-Goog-Upload-Header-Content-Type", "application/jsonl")
                    .json(&metadata))
            })
            .await?;

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                BatchError::Provider(ProviderError::InvalidResponse(
                    "upload start returned no x-goog-upload-url".to_string(),
                ))
            })?;

        let uploaded: Value = self
            .http
            .send_json(|client| {
                Ok(client
                    .post(&upload_url)
                    .header(API_KEY_HEADER, &self.api_key)
                    .header("X-Goog-Upload-Offset", "0")
                    .header("X-Goog-Upload-Command", "upload, finalize")
                    .body(bytes.clone()))
            })
            .await?;

        json_path(&uploaded, &[PathStep::Key("file"), PathStep::Key("name")])
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BatchError::Provider(ProviderError::InvalidResponse(
                    "upload response has no file.name".to_string(),
                ))
            })
    }

    async fn retrieve(&self, batch_id: &str) -> Result<Value> {
        let url = format!("{}/v1beta/{batch_id}", self.base_url);
        self.http
            .send_json(|client| Ok(client.get(&url).header(API_KEY_HEADER, &self.api_key)))
            .await
    }
}

/// Native state of a batch operation, wherever the API put it.
fn batch_state(batch: &Value) -> Option<&str> {
    json_path(batch, &[PathStep::Key("metadata"), PathStep::Key("state")])
        .or_else(|| batch.get("state"))
        .and_then(|v| v.as_str())
}

/// Name of the responses file of a finished batch.
fn responses_file(batch: &Value) -> Option<&str> {
    use PathStep::*;
    const CANDIDATES: &[&[PathStep]] = &[
        &[Key("response"), Key("responsesFile")],
        &[Key("metadata"), Key("output"), Key("responsesFile")],
        &[Key("dest"), Key("fileName")],
        &[Key("dest"), Key("file_name")],
    ];
    CANDIDATES
        .iter()
        .find_map(|path| json_path(batch, path).and_then(|v| v.as_str()))
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn submit(&self, payloads: &[Payload], destination: &Path) -> Result<Submission> {
        let input_file = request_file_path(destination, &self.model_key);
        write_jsonl(&input_file, &self.request_records(payloads))?;

        let file_name = self.upload(&input_file).await?;
        debug!(model = %self.model_key, file = %file_name, "Uploaded request file");

        let url = format!(
            "{}/v1beta/models/{}:batchGenerateContent",
            self.base_url, self.model_name
        );
        let body = json!({
            "batch": {
                "display_name": format!("batch_run_{}", self.model_key),
                "input_config": { "file_name": file_name },
            }
        });
        let batch: Value = self
            .http
            .send_json(|client| {
                Ok(client
                    .post(&url)
                    .header(API_KEY_HEADER, &self.api_key)
                    .json(&body))
            })
            .await?;

        let batch_id = batch
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BatchError::Provider(ProviderError::InvalidResponse(
                    "batch creation returned no name".to_string(),
                ))
            })?
            .to_string();

        info!(model = %self.model_key, batch_id = %batch_id, "Batch submitted");
        Ok(Submission {
            batch_id,
            input_file,
        })
    }

    async fn poll(&self, batch_id: &str) -> Result<PollStatus> {
        let batch = self.retrieve(batch_id).await?;
        let native = batch_state(&batch).unwrap_or("STATE_UNKNOWN").to_string();
        Ok(PollStatus {
            status: map_status(&native),
            native,
        })
    }

    async fn fetch_result(&self, batch_id: &str, destination: &Path) -> Result<PathBuf> {
        let batch = self.retrieve(batch_id).await?;
        let finished = batch_state(&batch).map(map_status) == Some(JobStatus::Completed);
        let file_name = match (finished, responses_file(&batch)) {
            (true, Some(name)) => name.to_string(),
            _ => {
                return Err(BatchError::Provider(ProviderError::ResultsUnavailable {
                    batch_id: batch_id.to_string(),
                }));
            }
        };

        debug!(batch_id = %batch_id, file = %file_name, "Downloading responses file");
        let url = format!("{}/download/v1beta/{file_name}:download", self.base_url);
        let content = self
            .http
            .send_bytes(|client| {
                Ok(client
                    .get(&url)
                    .query(&[("alt", "media")])
                    .header(API_KEY_HEADER, &self.api_key))
            })
            .await?;

        let path = result_file_path(destination, batch_id);
        write_atomic(&path, &content)?;
        Ok(path)
    }

    fn extract_text(&self, line: &Value) -> ExtractedLine {
        let custom_id = correlation_id(line, "key").or_else(|| correlation_id(line, "custom_id"));

        let parts = line
            .get("response")
            .and_then(|r| r.get("candidates"))
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());

        let text = parts.and_then(|parts| {
            parts
                .iter()
                .filter(|p| p.get("thought").and_then(|t| t.as_bool()) != Some(true))
                .find_map(|p| p.get("text")?.as_str())
        });

        match (text, line.get("error").filter(|e| !e.is_null())) {
            (Some(text), _) => ExtractedLine::ok(custom_id, text.to_string()),
            (None, Some(error)) => {
                let reason = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("error")
                    .to_string();
                ExtractedLine::failed(custom_id, ExtractionError::RequestFailed(reason))
            }
            (None, None) => ExtractedLine::failed(
                custom_id,
                ExtractionError::MissingField("response.candidates[0].content.parts[0].text"),
            ),
        }
    }
}

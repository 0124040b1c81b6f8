//! OpenAI batch API adapter, also used for OpenAI-compatible endpoints.
//!
//! Flow: JSONL request file -> multipart upload (`purpose=batch`) ->
//! `POST /batches` -> poll `GET /batches/{id}` -> download `output_file_id`.

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
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";

/// One line of the request file.
#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'static str,
    body: ChatBody<'a>,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateBatch<'a> {
    input_file_id: &'a str,
    endpoint: &'static str,
    completion_window: &'static str,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
}

/// Map a native batch status onto the canonical state.
///
/// `completed` without an output file means every request failed.
pub fn map_status(native: &str, has_output: bool) -> JobStatus {
    match native {
        "validating" | "in_progress" | "finalizing" | "cancelling" => JobStatus::Pending,
        "completed" if has_output => JobStatus::Completed,
        "completed" => JobStatus::Failed,
        "failed" | "expired" | "cancelled" => JobStatus::Failed,
        _ => JobStatus::Pending,
    }
}

/// Adapter for the OpenAI batch API and compatible servers.
pub struct OpenAiAdapter {
    kind: ProviderKind,
    model_key: String,
    model_name: String,
    max_tokens: u32,
    temperature: f64,
    api_key: String,
    base_url: String,
    http: HttpTransport,
}

impl OpenAiAdapter {
    /// Create an adapter for one configured model.
    pub fn new(
        model_key: &str,
        spec: &ModelSpec,
        api_key: String,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let base_url = match (spec.provider, spec.expanded_base_url()) {
            (_, Some(url)) => url,
            (ProviderKind::OpenAiCompatible, None) => {
                return Err(BatchError::Config(
                    crate::models::ConfigError::MissingBaseUrl(model_key.to_string()),
                ));
            }
            (_, None) => DEFAULT_BASE_URL.to_string(),
        };

        Ok(Self {
            kind: spec.provider,
            model_key: model_key.to_string(),
            model_name: spec.model_name.clone(),
            max_tokens: spec.max_tokens,
            temperature: spec.temperature,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: HttpTransport::new(spec.provider.to_string(), timeout_secs, max_retries)?,
        })
    }

    fn request_records<'a>(&'a self, payloads: &'a [Payload]) -> Vec<BatchRequest<'a>> {
        payloads
            .iter()
            .map(|p| BatchRequest {
                custom_id: &p.id,
                method: "POST",
                url: COMPLETIONS_ENDPOINT,
                body: ChatBody {
                    model: &self.model_name,
                    messages: [
                        ChatMessage {
                            role: "system",
                            content: &p.system_prompt,
                        },
                        ChatMessage {
                            role: "user",
                            content: &p.user_query,
                        },
                    ],
                    max_tokens: self.max_tokens,
                    temperature: self.temperature,
                },
            })
            .collect()
    }

    async fn upload(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path).map_err(|e| BatchError::io("reading request file", e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch_input.jsonl".to_string());
        let url = format!("{}/files", self.base_url);

        let file: FileObject = self
            .http
            .send_json(|client| {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str("application/jsonl")
                    .map_err(BatchError::Network)?;
                let form = Form::new().text("purpose", "batch").part("file", part);
                Ok(client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .multipart(form))
            })
            .await?;
        Ok(file.id)
    }

    async fn retrieve(&self, batch_id: &str) -> Result<BatchObject> {
        let url = format!("{}/batches/{batch_id}", self.base_url);
        self.http
            .send_json(|client| Ok(client.get(&url).bearer_auth(&self.api_key)))
            .await
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn submit(&self, payloads: &[Payload], destination: &Path) -> Result<Submission> {
        let input_file = request_file_path(destination, &self.model_key);
        write_jsonl(&input_file, &self.request_records(payloads))?;

        let file_id = self.upload(&input_file).await?;
        debug!(model = %self.model_key, file_id = %file_id, "Uploaded request file");

        let url = format!("{}/batches", self.base_url);
        let body = CreateBatch {
            input_file_id: &file_id,
            endpoint: COMPLETIONS_ENDPOINT,
            completion_window: COMPLETION_WINDOW,
        };
        let batch: BatchObject = self
            .http
            .send_json(|client| Ok(client.post(&url).bearer_auth(&self.api_key).json(&body)))
            .await?;

        info!(model = %self.model_key, batch_id = %batch.id, "Batch submitted");
        Ok(Submission {
            batch_id: batch.id,
            input_file,
        })
    }

    async fn poll(&self, batch_id: &str) -> Result<PollStatus> {
        let batch = self.retrieve(batch_id).await?;
        Ok(PollStatus {
            status: map_status(&batch.status, batch.output_file_id.is_some()),
            native: batch.status,
        })
    }

    async fn fetch_result(&self, batch_id: &str, destination: &Path) -> Result<PathBuf> {
        let batch = self.retrieve(batch_id).await?;
        let output_file_id = match (batch.status.as_str(), batch.output_file_id) {
            ("completed", Some(id)) => id,
            _ => {
                return Err(BatchError::Provider(ProviderError::ResultsUnavailable {
                    batch_id: batch_id.to_string(),
                }));
            }
        };

        let url = format!("{}/files/{output_file_id}/content", self.base_url);
        let content = self
            .http
            .send_bytes(|client| Ok(client.get(&url).bearer_auth(&self.api_key)))
            .await?;

        let path = result_file_path(destination, batch_id);
        write_atomic(&path, &content)?;
        Ok(path)
    }

    fn extract_text(&self, line: &serde_json::Value) -> ExtractedLine {
        use PathStep::*;
        let custom_id = correlation_id(line, "custom_id");

        const CONTENT: &[PathStep] = &[
            Key("response"),
            Key("body"),
            Key("choices"),
            Index(0),
            Key("message"),
            Key("content"),
        ];
        if let Some(text) = json_path(line, CONTENT).and_then(|v| v.as_str()) {
            return ExtractedLine::ok(custom_id, text.to_string());
        }

        match line.get("error").filter(|e| !e.is_null()) {
            Some(error) => {
                let reason = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("error")
                    .to_string();
                ExtractedLine::failed(custom_id, ExtractionError::RequestFailed(reason))
            }
            None => ExtractedLine::failed(
                custom_id,
                ExtractionError::MissingField("response.body.choices[0].message.content"),
            ),
        }
    }
}

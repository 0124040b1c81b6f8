//! Anthropic Message Batches adapter.
//!
//! Requests are sent inline as the `requests` array; the same records are
//! also written as JSONL so every job has a request file on disk.

use crate::models::{
    BatchError, ExtractionError, JobStatus, ModelSpec, Payload, ProviderError, ProviderKind,
    Result,
};
use crate::provider::{
    ExtractedLine, HttpTransport, PollStatus, ProviderAdapter, Submission, correlation_id,
    request_file_path, result_file_path, write_jsonl,
};
use crate::store::write_atomic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    custom_id: &'a str,
    params: MessageParams<'a>,
}

#[derive(Debug, Serialize)]
struct MessageParams<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [UserMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateBatch<'a> {
    requests: &'a [BatchRequest<'a>],
}

#[derive(Debug, Deserialize)]
struct MessageBatch {
    id: String,
    processing_status: String,
    #[serde(default)]
    results_url: Option<String>,
}

/// Map a native `processing_status` onto the canonical state.
///
/// `ended` covers batches whose individual requests errored or expired;
/// those surface per line as extraction errors.
pub fn map_status(native: &str) -> JobStatus {
    match native {
        "in_progress" | "canceling" => JobStatus::Pending,
        "ended" => JobStatus::Completed,
        _ => JobStatus::Pending,
    }
}

/// Adapter for the Anthropic Message Batches API.
pub struct AnthropicAdapter {
    model_key: String,
    model_name: String,
    max_tokens: u32,
    api_key: String,
    base_url: String,
    http: HttpTransport,
}

impl AnthropicAdapter {
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

        Ok(Self {
            model_key: model_key.to_string(),
            model_name: spec.model_name.clone(),
            max_tokens: spec.max_tokens,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            http: HttpTransport::new("anthropic", timeout_secs, max_retries)?,
        })
    }

    fn request_records<'a>(&'a self, payloads: &'a [Payload]) -> Vec<BatchRequest<'a>> {
        payloads
            .iter()
            .map(|p| BatchRequest {
                custom_id: &p.id,
                params: MessageParams {
                    model: &self.model_name,
                    max_tokens: self.max_tokens,
                    system: &p.system_prompt,
                    messages: [UserMessage {
                        role: "user",
                        content: &p.user_query,
                    }],
                },
            })
            .collect()
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    async fn retrieve(&self, batch_id: &str) -> Result<MessageBatch> {
        let url = format!("{}/messages/batches/{batch_id}", self.base_url);
        self.http
            .send_json(|client| Ok(self.authorized(client.get(&url))))
            .await
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn submit(&self, payloads: &[Payload], destination: &Path) -> Result<Submission> {
        let requests = self.request_records(payloads);
        let input_file = request_file_path(destination, &self.model_key);
        write_jsonl(&input_file, &requests)?;

        let url = format!("{}/messages/batches", self.base_url);
        let body = CreateBatch {
            requests: &requests,
        };
        let batch: MessageBatch = self
            .http
            .send_json(|client| Ok(self.authorized(client.post(&url)).json(&body)))
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
            status: map_status(&batch.processing_status),
            native: batch.processing_status,
        })
    }

    async fn fetch_result(&self, batch_id: &str, destination: &Path) -> Result<PathBuf> {
        let batch = self.retrieve(batch_id).await?;
        let results_url = match (batch.processing_status.as_str(), batch.results_url) {
            ("ended", Some(url)) => url,
            _ => {
                return Err(BatchError::Provider(ProviderError::ResultsUnavailable {
                    batch_id: batch_id.to_string(),
                }));
            }
        };

        let content = self
            .http
            .send_bytes(|client| Ok(self.authorized(client.get(&results_url))))
            .await?;

        let path = result_file_path(destination, batch_id);
        write_atomic(&path, &content)?;
        Ok(path)
    }

    fn extract_text(&self, line: &serde_json::Value) -> ExtractedLine {
        let custom_id = correlation_id(line, "custom_id");

        let Some(result) = line.get("result") else {
            return ExtractedLine::failed(custom_id, ExtractionError::MissingField("result"));
        };

        match result.get("type").and_then(|t| t.as_str()) {
            Some("succeeded") => {}
            Some(other) => {
                return ExtractedLine::failed(
                    custom_id,
                    ExtractionError::RequestFailed(other.to_string()),
                );
            }
            None => {
                return ExtractedLine::failed(custom_id, ExtractionError::MissingField("result.type"));
            }
        }

        let text = result
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
            .and_then(|blocks| blocks.iter().find_map(|b| b.get("text")?.as_str()));

        match text {
            Some(text) => ExtractedLine::ok(custom_id, text.to_string()),
            None => ExtractedLine::failed(
                custom_id,
                ExtractionError::MissingField("result.message.content[].text"),
            ),
        }
    }
}

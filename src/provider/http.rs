//! Shared HTTP transport for provider adapters.
//!
//! - Every request carries the client-level timeout
//! - Network errors, 429 and 5xx are retried with exponential backoff
//! - A usable `retry-after` header replaces the backoff, up to one minute
//! - 401/403/404 fail immediately

use crate::models::{BatchError, ProviderError, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Error body shared by the OpenAI, Anthropic and Gemini APIs.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Longest wait honored from a `retry-after` header.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Parse a `retry-after` value in seconds. Negative or non-finite values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())))
}

/// HTTP client with retry policy, one per adapter.
pub struct HttpTransport {
    client: reqwest::Client,
    /// Provider name (for logging)
    name: String,
    timeout: Duration,
    max_retries: u32,
}

impl HttpTransport {
    /// Create a transport with a per-request timeout.
    pub fn new(name: impl Into<String>, timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BatchError::Network)?;

        Ok(Self {
            client,
            name: name.into(),
            timeout,
            max_retries: max_retries.max(1),
        })
    }

    /// Send a request and decode a JSON body.
    pub async fn send_json<T, F>(&self, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> Result<reqwest::RequestBuilder>,
    {
        let response = self.send(build).await?;
        response
            .json()
            .await
            .map_err(|e| BatchError::ParseError(format!("{}: failed to parse response: {e}", self.name)))
    }

    /// Send a request and return the raw body.
    pub async fn send_bytes<F>(&self, build: F) -> Result<Vec<u8>>
    where
        F: Fn(&reqwest::Client) -> Result<reqwest::RequestBuilder>,
    {
        let response = self.send(build).await?;
        let bytes = response.bytes().await.map_err(BatchError::Network)?;
        Ok(bytes.to_vec())
    }

    /// Send a request, retrying transient failures.
    ///
    /// `build` is called once per attempt because request bodies are consumed.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> Result<reqwest::RequestBuilder>,
    {
        let mut last_error: Option<BatchError> = None;

        for attempt in 0..self.max_retries {
            let response = build(&self.client)?.send().await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        BatchError::Timeout(self.timeout)
                    } else {
                        BatchError::Network(e)
                    });
                    self.backoff(attempt, None).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            let error = self.classify(status, &url, body);

            let retryable = error.is_retryable();
            last_error = Some(error);
            if !retryable {
                break;
            }
            self.backoff(attempt, retry_after).await;
        }

        Err(last_error.unwrap_or_else(|| {
            BatchError::Provider(ProviderError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "Unknown error".to_string(),
            })
        }))
    }

    fn classify(&self, status: StatusCode, url: &str, body: String) -> BatchError {
        let error = match status.as_u16() {
            401 | 403 => ProviderError::AuthenticationFailed {
                provider: self.name.clone(),
            },
            404 => ProviderError::NotFound(url.to_string()),
            code => {
                let message = serde_json::from_str::<ApiErrorResponse>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                ProviderError::ApiError {
                    status: code,
                    message,
                }
            }
        };
        BatchError::Provider(error)
    }

    async fn backoff(&self, attempt: u32, retry_after: Option<Duration>) {
        if attempt + 1 >= self.max_retries {
            return;
        }
        let wait = retry_after.unwrap_or_else(|| Duration::from_secs(2u64.pow(attempt)));
        debug!(
            provider = %self.name,
            attempt = attempt,
            wait_ms = wait.as_millis() as u64,
            "Retrying request"
        );
        tokio::time::sleep(wait).await;
    }
}

//! querybench - Batch evaluation of natural-language-to-SPARQL prompts across LLM providers.
//!
//! ## Architecture
//!
//! A batch moves through four stages:
//! - **Dispatcher**: submits one batch per model through that model's provider adapter
//! - **Job Store**: persists every submitted batch in a single JSON table
//! - **Poller**: checks pending batches concurrently and downloads finished results
//! - **Normalizer**: joins result lines to the submitted prompts as canonical records
//!
//! ## Providers
//!
//! OpenAI, Anthropic, Google Gemini and OpenAI-compatible endpoints, each behind
//! the `ProviderAdapter` trait. Canonical status is always one of
//! Pending, Completed or Failed.

pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod provider;
pub mod store;

// Re-exports for convenience
pub use models::{
    BatchError, CanonicalRecord, Config, JobRecord, JobStatus, JobTable, Payload, ProviderKind,
    QueryItem, Result,
};
pub use pipeline::{Poller, ResultNormalizer, SubmissionDispatcher};
pub use prompt::PromptBuilder;
pub use provider::{AdapterResolver, ProviderAdapter, ProviderRegistry};
pub use store::JobStore;

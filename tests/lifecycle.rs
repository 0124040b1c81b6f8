//! End-to-end batch lifecycle against a scripted in-memory provider.

use async_trait::async_trait;
use querybench::models::{
    BatchError, ConfigError, ExtractionError, JobStatus, Payload, ProviderError, ProviderKind,
    Result,
};
use querybench::pipeline::{
    EXTRACTION_ERROR, Poller, ResultNormalizer, SubmissionDispatcher, summary_path,
};
use querybench::provider::{
    AdapterResolver, ExtractedLine, PollStatus, ProviderAdapter, Submission, request_file_path,
    result_file_path, write_jsonl,
};
use querybench::{CanonicalRecord, JobStore};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum PollScript {
    Running,
    Succeeded,
    Failed(&'static str),
    Error,
    Hang,
    Panic,
}

/// Provider that answers from a script instead of the network.
struct ScriptedAdapter {
    fail_submit: bool,
    poll: Mutex<PollScript>,
    result_lines: Vec<String>,
    submitted: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(poll: PollScript, result_lines: Vec<String>) -> Arc<Self> {
        Self::build(poll, result_lines, false)
    }

    fn rejecting() -> Arc<Self> {
        Self::build(PollScript::Running, Vec::new(), true)
    }

    fn build(poll: PollScript, result_lines: Vec<String>, fail_submit: bool) -> Arc<Self> {
        Arc::new(Self {
            fail_submit,
            poll: Mutex::new(poll),
            result_lines,
            submitted: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn set_poll(&self, script: PollScript) {
        *self.poll.lock().unwrap() = script;
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompatible
    }

    async fn submit(&self, payloads: &[Payload], destination: &Path) -> Result<Submission> {
        if self.fail_submit {
            return Err(ProviderError::AuthenticationFailed {
                provider: "scripted".to_string(),
            }
            .into());
        }
        let input_file = request_file_path(destination, "scripted");
        let records: Vec<_> = payloads
            .iter()
            .map(|p| json!({"custom_id": p.id, "prompt": p.system_prompt}))
            .collect();
        write_jsonl(&input_file, &records)?;

        let n = self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(Submission {
            batch_id: format!("batch_{n}"),
            input_file,
        })
    }

    async fn poll(&self, _batch_id: &str) -> Result<PollStatus> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let script = self.poll.lock().unwrap().clone();
        let outcome = match script {
            PollScript::Running => Ok(PollStatus {
                status: JobStatus::Pending,
                native: "in_progress".to_string(),
            }),
            PollScript::Succeeded => Ok(PollStatus {
                status: JobStatus::Completed,
                native: "completed".to_string(),
            }),
            PollScript::Failed(native) => Ok(PollStatus {
                status: JobStatus::Failed,
                native: native.to_string(),
            }),
            PollScript::Error => Err(ProviderError::ApiError {
                status: 503,
                message: "unavailable".to_string(),
            }
            .into()),
            PollScript::Panic => panic!("adapter bug while polling"),
            PollScript::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Err(BatchError::Internal("unreachable".to_string()))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn fetch_result(&self, batch_id: &str, destination: &Path) -> Result<PathBuf> {
        let path = result_file_path(destination, batch_id);
        std::fs::write(&path, self.result_lines.join("\n"))
            .map_err(|e| BatchError::io("writing results", e))?;
        Ok(path)
    }

    fn extract_text(&self, line: &serde_json::Value) -> ExtractedLine {
        let custom_id = line
            .get("custom_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        match line.get("text").and_then(|v| v.as_str()) {
            Some(text) => ExtractedLine::ok(custom_id, text.to_string()),
            None => ExtractedLine::failed(custom_id, ExtractionError::MissingField("text")),
        }
    }
}

#[derive(Default)]
struct Resolver {
    adapters: HashMap<String, Arc<ScriptedAdapter>>,
}

impl Resolver {
    fn with(mut self, key: &str, adapter: Arc<ScriptedAdapter>) -> Self {
        self.adapters.insert(key.to_string(), adapter);
        self
    }
}

impl AdapterResolver for Resolver {
    fn resolve(&self, model_key: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(model_key)
            .map(|a| Arc::clone(a) as Arc<dyn ProviderAdapter>)
            .ok_or_else(|| ConfigError::ModelNotFound(model_key.to_string()).into())
    }
}

fn payloads() -> Vec<Payload> {
    ["1", "2", "3"]
        .iter()
        .map(|id| Payload {
            id: id.to_string(),
            system_prompt: format!("prompt {id}"),
            user_query: format!("question {id}"),
            ground_truth: Some(format!("SELECT ?x{id} {{}}")),
        })
        .collect()
}

fn line(id: &str, text: &str) -> String {
    json!({"custom_id": id, "text": text}).to_string()
}

struct Harness {
    dir: TempDir,
    store: JobStore,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("batch_jobs.json"));
        Self { dir, store }
    }

    fn dispatcher<'a>(&'a self, resolver: &'a Resolver) -> SubmissionDispatcher<'a> {
        SubmissionDispatcher::new(&self.store, resolver, self.dir.path(), Duration::from_secs(5))
    }

    fn poller<'a>(&'a self, resolver: &'a Resolver) -> Poller<'a> {
        Poller::new(&self.store, resolver, 4, Duration::from_secs(2))
    }

    async fn submit(&self, resolver: &Resolver, keys: &[&str]) -> Vec<String> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let report = self
            .dispatcher(resolver)
            .dispatch(&keys, &payloads())
            .await
            .unwrap();
        report.submitted.into_iter().map(|b| b.batch_id).collect()
    }
}

fn read_records(path: &Path) -> Vec<CanonicalRecord> {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn unknown_correlation_id_is_dropped() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(
        PollScript::Succeeded,
        vec![
            line("1", "```sparql\nSELECT ?a {}\n```"),
            line("9", "SELECT ?stray {}"),
            line("2", "SELECT ?b {}"),
        ],
    );
    let resolver = Resolver::default().with("alpha", adapter);

    let ids = h.submit(&resolver, &["alpha"]).await;
    assert_eq!(ids.len(), 1);

    let polled = h.poller(&resolver).poll_pending().await.unwrap();
    assert_eq!(polled.completed, 1);

    let report = ResultNormalizer::new(&h.store, &resolver)
        .process_completed(&payloads())
        .unwrap();
    assert_eq!(report.jobs_processed, 1);
    assert_eq!(report.records_written, 2);
    assert_eq!(report.unmatched_lines, 1);

    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.results_processed);

    let records = read_records(&summary_path(&job.output_dir));
    let got: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(got, ["1", "2"]);
    assert_eq!(records[0].generated_text, "SELECT ?a {}");
    assert_eq!(records[0].raw_response, "```sparql\nSELECT ?a {}\n```");
    assert_eq!(records[0].model, "alpha");
    assert_eq!(records[0].query, "question 1");
    assert_eq!(records[1].ground_truth.as_deref(), Some("SELECT ?x2 {}"));
}

#[tokio::test]
async fn poll_error_leaves_job_pending() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(PollScript::Error, vec![line("1", "SELECT 1")]);
    let resolver = Resolver::default().with("alpha", adapter);
    let ids = h.submit(&resolver, &["alpha"]).await;

    let before = std::fs::read(h.store.path()).unwrap();
    let report = h.poller(&resolver).poll_pending().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.still_pending, 1);

    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.result_file.is_none());
    assert_eq!(std::fs::read(h.store.path()).unwrap(), before);
}

#[tokio::test]
async fn panicking_poll_is_reported_and_job_stays_pending() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(PollScript::Panic, Vec::new());
    let resolver = Resolver::default().with("alpha", adapter);
    let ids = h.submit(&resolver, &["alpha"]).await;

    let report = h.poller(&resolver).poll_pending().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.still_pending, 1);
    assert_eq!(
        report.checked,
        report.completed + report.failed + report.still_pending
    );
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].batch_id, ids[0]);
    assert!(report.errors[0].error.contains("panicked"));

    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.result_file.is_none());
}

#[tokio::test]
async fn stalled_poll_hits_deadline() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(PollScript::Hang, Vec::new());
    let resolver = Resolver::default().with("alpha", adapter);
    let ids = h.submit(&resolver, &["alpha"]).await;

    let poller = Poller::new(&h.store, &resolver, 1, Duration::from_millis(50));
    let report = poller.poll_pending().await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].error.contains("timeout"));

    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn failed_submission_does_not_block_other_models() {
    let h = Harness::new();
    let resolver = Resolver::default()
        .with("broken", ScriptedAdapter::rejecting())
        .with("alpha", ScriptedAdapter::new(PollScript::Running, Vec::new()));

    let keys = vec!["broken".to_string(), "missing".to_string(), "alpha".to_string()];
    let report = h.dispatcher(&resolver).dispatch(&keys, &payloads()).await.unwrap();

    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.submitted[0].model_key, "alpha");
    let failed: Vec<&str> = report.failed.iter().map(|f| f.model_key.as_str()).collect();
    assert_eq!(failed, ["broken", "missing"]);

    let jobs = h.store.load().unwrap();
    assert_eq!(jobs.len(), 1);
    let job = jobs.values().next().unwrap();
    assert_eq!(job.model_key, "alpha");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.input_file.as_ref().unwrap().exists());
}

#[tokio::test]
async fn normalizing_twice_is_byte_identical() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(
        PollScript::Succeeded,
        vec![line("3", "SELECT 3"), line("1", "SELECT 1")],
    );
    let resolver = Resolver::default().with("alpha", adapter);
    let ids = h.submit(&resolver, &["alpha"]).await;
    h.poller(&resolver).poll_pending().await.unwrap();

    let normalizer = ResultNormalizer::new(&h.store, &resolver);
    normalizer.process_completed(&payloads()).unwrap();
    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    let summary = summary_path(&job.output_dir);
    let first = std::fs::read(&summary).unwrap();

    let again = normalizer.process_completed(&payloads()).unwrap();
    assert_eq!(again.jobs_processed, 0);
    assert_eq!(std::fs::read(&summary).unwrap(), first);

    h.store
        .update(|jobs| {
            if let Some(job) = jobs.get_mut(&ids[0]) {
                job.results_processed = false;
            }
            Ok(())
        })
        .unwrap();
    let rerun = normalizer.process_completed(&payloads()).unwrap();
    assert_eq!(rerun.jobs_processed, 1);
    assert_eq!(std::fs::read(&summary).unwrap(), first);
    assert!(h.store.load().unwrap()[&ids[0]].results_processed);
}

#[tokio::test]
async fn provider_failure_is_terminal() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(PollScript::Failed("expired"), Vec::new());
    let resolver = Resolver::default().with("alpha", Arc::clone(&adapter));
    let ids = h.submit(&resolver, &["alpha"]).await;

    let report = h.poller(&resolver).poll_pending().await.unwrap();
    assert_eq!(report.failed, 1);

    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_reason.unwrap().contains("expired"));
    assert!(job.result_file.is_none());

    adapter.set_poll(PollScript::Succeeded);
    let next = h.poller(&resolver).poll_pending().await.unwrap();
    assert_eq!(next.checked, 0);
    assert_eq!(h.store.load().unwrap()[&ids[0]].status, JobStatus::Failed);
}

#[tokio::test]
async fn bad_lines_get_sentinel_and_processing_continues() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(
        PollScript::Succeeded,
        vec![
            json!({"custom_id": "1", "error": "boom"}).to_string(),
            "{not json".to_string(),
            String::new(),
            line("2", "SELECT 2"),
        ],
    );
    let resolver = Resolver::default().with("alpha", adapter);
    let ids = h.submit(&resolver, &["alpha"]).await;
    h.poller(&resolver).poll_pending().await.unwrap();

    let report = ResultNormalizer::new(&h.store, &resolver)
        .process_completed(&payloads())
        .unwrap();
    assert_eq!(report.records_written, 2);
    assert_eq!(report.extraction_failures, 2);

    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    assert!(job.results_processed);
    let records = read_records(&summary_path(&job.output_dir));
    assert_eq!(records[0].id, "1");
    assert_eq!(records[0].generated_text, EXTRACTION_ERROR);
    assert_eq!(records[0].raw_response, EXTRACTION_ERROR);
    assert_eq!(records[1].generated_text, "SELECT 2");

    let log = std::fs::read_to_string(job.output_dir.join("detailed_logs.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 2);
}

#[tokio::test]
async fn missing_result_file_skips_job() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(PollScript::Succeeded, vec![line("1", "SELECT 1")]);
    let resolver = Resolver::default().with("alpha", adapter);
    let ids = h.submit(&resolver, &["alpha"]).await;
    h.poller(&resolver).poll_pending().await.unwrap();

    let job = h.store.load().unwrap().remove(&ids[0]).unwrap();
    std::fs::remove_file(job.result_file.unwrap()).unwrap();

    let report = ResultNormalizer::new(&h.store, &resolver)
        .process_completed(&payloads())
        .unwrap();
    assert_eq!(report.skipped_missing_file, 1);
    assert_eq!(report.jobs_processed, 0);
    assert!(!h.store.load().unwrap()[&ids[0]].results_processed);
}

#[tokio::test]
async fn polling_respects_concurrency_limit() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(PollScript::Running, Vec::new());
    let resolver = Resolver::default().with("alpha", Arc::clone(&adapter));
    for _ in 0..6 {
        h.submit(&resolver, &["alpha"]).await;
    }
    assert_eq!(h.store.load().unwrap().len(), 6);

    let report = Poller::new(&h.store, &resolver, 2, Duration::from_secs(2))
        .poll_pending()
        .await
        .unwrap();
    assert_eq!(report.checked, 6);
    assert_eq!(report.still_pending, 6);
    assert!(adapter.max_in_flight.load(Ordering::SeqCst) <= 2);

    let jobs = h.store.load().unwrap();
    assert!(jobs.values().all(|j| j.native_status.as_deref() == Some("in_progress")));
}

#[tokio::test]
async fn back_to_back_submissions_get_separate_run_dirs() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(PollScript::Running, Vec::new());
    let resolver = Resolver::default().with("alpha", adapter);
    let keys = vec!["alpha".to_string()];

    let first = h.dispatcher(&resolver).dispatch(&keys, &payloads()).await.unwrap();
    let second = h.dispatcher(&resolver).dispatch(&keys, &payloads()).await.unwrap();
    let first_dir = &first.submitted[0].output_dir;
    let second_dir = &second.submitted[0].output_dir;
    assert_ne!(first_dir, second_dir);

    let jobs = h.store.load().unwrap();
    assert_eq!(jobs.len(), 2);
    for job in jobs.values() {
        let input = job.input_file.as_ref().unwrap();
        assert!(input.starts_with(&job.output_dir));
        assert!(input.exists());
    }
}

#[tokio::test]
async fn results_join_against_the_full_query_set() {
    let h = Harness::new();
    let adapter = ScriptedAdapter::new(
        PollScript::Succeeded,
        vec![line("2", "SELECT 2"), line("3", "SELECT 3")],
    );
    let resolver = Resolver::default().with("alpha", adapter);

    let subset: Vec<Payload> = payloads().into_iter().filter(|p| p.id != "1").collect();
    let keys = vec!["alpha".to_string()];
    let submitted = h.dispatcher(&resolver).dispatch(&keys, &subset).await.unwrap();
    h.poller(&resolver).poll_pending().await.unwrap();

    let report = ResultNormalizer::new(&h.store, &resolver)
        .process_completed(&payloads())
        .unwrap();
    assert_eq!(report.records_written, 2);
    assert_eq!(report.unmatched_lines, 0);

    let records = read_records(&summary_path(&submitted.submitted[0].output_dir));
    let got: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(got, ["2", "3"]);
}

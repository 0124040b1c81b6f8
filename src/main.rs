//! querybench CLI - Submit and collect NL-to-SPARQL evaluation batches.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use querybench::prompt::{filter_by_database, load_queries};
use querybench::{
    BatchError, Config, JobStore, Payload, Poller, PromptBuilder, ProviderRegistry, ResultNormalizer,
    SubmissionDispatcher,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "querybench")]
#[command(version)]
#[command(about = "Batch evaluation of NL-to-SPARQL prompts across LLM provider batch APIs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one batch per configured model
    Submit {
        /// Submit for this model key only
        #[arg(short, long)]
        model: Option<String>,

        /// Only queries whose target databases mention this name
        #[arg(long)]
        filter_db: Option<String>,
    },

    /// Poll pending batches, download finished results and normalize them
    ///
    /// Results are joined against the full query file, so batches submitted
    /// with any `--filter-db` subset are matched.
    Check,

    /// List recorded batch jobs
    Jobs,

    /// Validate configuration file and credentials
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# querybench configuration file

output_dir = "raw_outputs"
queries = "data/queries.json"

[prompt]
system_prompt = "system_prompt.txt"
ontology_file = "ontology/linkedmusic.ttl"

[batch]
# metadata_file = "raw_outputs/batch_jobs.json"
poll_concurrency = 4
call_timeout_secs = 120
max_retries = 3

[models.gpt-4o]
provider = "openai"
model_name = "gpt-4o"
env_key = "OPENAI_API_KEY"

[models.claude-sonnet]
provider = "anthropic"
model_name = "claude-sonnet-4-20250514"
env_key = "ANTHROPIC_API_KEY"
max_tokens = 2048

[models.gemini-flash]
provider = "google"
model_name = "gemini-2.5-flash"
env_key = "GEMINI_API_KEY"

[models.qwen-plus]
provider = "openai_compatible"
model_name = "qwen-plus"
env_key = "DASHSCOPE_API_KEY"
base_url = "${DASHSCOPE_BASE_URL}"
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

/// Rebuild the payload set from the query file and prompt inputs.
fn build_payloads(
    config: &Config,
    filter_db: Option<&str>,
) -> Result<(PromptBuilder, Vec<Payload>)> {
    let builder = PromptBuilder::from_config(config).context("Failed to load prompt inputs")?;
    let mut items = load_queries(&config.queries).context("Failed to load queries")?;
    if let Some(db) = filter_db {
        items = filter_by_database(items, db);
    }
    let payloads = builder.payloads(&items);
    Ok((builder, payloads))
}

/// Whether any error in the chain must stop all further runs until fixed by hand.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<BatchError>())
        .any(BatchError::is_fatal)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let result = run(cli).await;
    if result.as_ref().is_err_and(is_fatal) {
        error!("Job store cannot be read; restore it from its .backup.json copy before the next run");
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;

            let mut missing = 0;
            for (key, spec) in &config.models {
                match spec.resolve_api_key(key) {
                    Ok(_) => info!("  {key}: {} / {}", spec.provider, spec.model_name),
                    Err(e) => {
                        warn!("  {key}: {e}");
                        missing += 1;
                    }
                }
            }
            if missing > 0 {
                bail!("{missing} model(s) have no usable API key");
            }

            let queries = load_queries(&config.queries).context("Failed to load queries")?;

            info!("Configuration is valid");
            info!("  Models: {}", config.models.len());
            info!("  Queries: {}", queries.len());
            info!("  Job store: {:?}", config.jobs_file());
            return Ok(());
        }

        Commands::Jobs => {
            let config = load_config(&cli.config)?;
            let store = JobStore::new(config.jobs_file());
            let jobs = store.load().context("Failed to load job store")?;

            if jobs.is_empty() {
                println!("No batch jobs recorded in {:?}", store.path());
                return Ok(());
            }

            println!(
                "{:<40} {:<20} {:<18} {:<10} {:<9} CREATED",
                "BATCH", "MODEL", "PROVIDER", "STATUS", "PROCESSED"
            );
            for (batch_id, job) in &jobs {
                println!(
                    "{:<40} {:<20} {:<18} {:<10} {:<9} {}",
                    batch_id,
                    job.model_key,
                    job.provider.to_string(),
                    job.status.to_string(),
                    if job.results_processed { "yes" } else { "no" },
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
                if let Some(reason) = &job.failure_reason {
                    println!("    failure: {reason}");
                }
            }
        }

        Commands::Submit { model, filter_db } => {
            let config = load_config(&cli.config)?;

            let model_keys: Vec<String> = match model {
                Some(key) => {
                    config.model(&key)?;
                    vec![key]
                }
                None => config.models.keys().cloned().collect(),
            };
            if model_keys.is_empty() {
                bail!("No models configured in {:?}", cli.config);
            }

            let (builder, payloads) = build_payloads(&config, filter_db.as_deref())?;
            let store = JobStore::new(config.jobs_file());
            let registry = ProviderRegistry::new(config.clone());

            let dispatcher = SubmissionDispatcher::from_config(&store, &registry, &config)?
                .with_snapshot("ontology_snapshot.ttl", builder.ontology());
            let report = dispatcher.dispatch(&model_keys, &payloads).await?;

            println!("\n=== Batch Submission Complete ===");
            println!("Payloads:    {}", payloads.len());
            println!("Submitted:   {}", report.submitted.len());
            for batch in &report.submitted {
                println!("  {} -> {}", batch.model_key, batch.batch_id);
            }
            println!("Failed:      {}", report.failed.len());
            for failure in &report.failed {
                println!("  {}: {}", failure.model_key, failure.error);
            }
            println!("Job store:   {:?}", store.path());
        }

        Commands::Check => {
            let config = load_config(&cli.config)?;
            let store = JobStore::new(config.jobs_file());
            let registry = ProviderRegistry::new(config.clone());

            let poller = Poller::new(
                &store,
                &registry,
                config.batch.poll_concurrency,
                Duration::from_secs(config.batch.call_timeout_secs),
            );
            let polled = poller.poll_pending().await?;

            let (_, payloads) = build_payloads(&config, None)?;
            let normalizer = ResultNormalizer::new(&store, &registry);
            let normalized = normalizer.process_completed(&payloads)?;

            println!("\n=== Batch Check Complete ===");
            println!("Checked:     {}", polled.checked);
            println!("Completed:   {}", polled.completed);
            println!("Failed:      {}", polled.failed);
            println!("Pending:     {}", polled.still_pending);
            println!("Poll errors: {}", polled.errors.len());
            println!("Processed:   {} batch(es)", normalized.jobs_processed);
            println!("Records:     {}", normalized.records_written);
            println!("Unmatched:   {}", normalized.unmatched_lines);
            println!("Extraction:  {} failure(s)", normalized.extraction_failures);
            if normalized.skipped_missing_file > 0 {
                println!("Missing:     {} result file(s)", normalized.skipped_missing_file);
            }
            for error in polled.errors.iter().chain(&normalized.errors) {
                println!("  {} ({}): {}", error.batch_id, error.model_key, error.error);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_corruption_is_fatal_through_context() {
        let corrupt: std::result::Result<(), BatchError> = Err(BatchError::StoreCorruption {
            path: PathBuf::from("batch_jobs.json"),
            message: "expected value at line 1".to_string(),
        });
        let err = corrupt.context("Failed to load job store").unwrap_err();
        assert!(is_fatal(&err));

        let timeout: std::result::Result<(), BatchError> =
            Err(BatchError::Timeout(Duration::from_secs(1)));
        assert!(!is_fatal(&timeout.context("Polling").unwrap_err()));
        assert!(!is_fatal(&anyhow::anyhow!("No models configured")));
    }
}

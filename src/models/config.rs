//! Configuration models for querybench.
//!
//! Everything the run needs is resolved from one TOML file. Secrets never
//! live in the file: each model names the environment variable holding its key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::ProviderKind;

/// Top-level configuration for querybench.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for per-run output directories
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Query set (JSON array of query items)
    pub queries: PathBuf,

    /// Prompt assembly inputs
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Batch lifecycle settings
    #[serde(default)]
    pub batch: BatchConfig,

    /// Logical model key -> provider model
    #[serde(default)]
    pub models: BTreeMap<String, ModelSpec>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("raw_outputs")
}

/// Prompt template and ontology locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// System prompt template (built-in fallback if missing)
    #[serde(default = "default_system_prompt")]
    pub system_prompt: PathBuf,

    /// Ontology text appended to every prompt (empty if missing)
    #[serde(default = "default_ontology_file")]
    pub ontology_file: PathBuf,
}

fn default_system_prompt() -> PathBuf {
    PathBuf::from("system_prompt.txt")
}

fn default_ontology_file() -> PathBuf {
    PathBuf::from("ontology.ttl")
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            ontology_file: default_ontology_file(),
        }
    }
}

/// Batch submission and polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Job store location (default: `<output_dir>/batch_jobs.json`)
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,

    /// Maximum jobs polled concurrently
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,

    /// Deadline for a single adapter call in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Maximum HTTP attempts per request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_poll_concurrency() -> usize {
    4
}

fn default_call_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            metadata_file: None,
            poll_concurrency: default_poll_concurrency(),
            call_timeout_secs: default_call_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Specification for one logical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Provider family that serves this model
    pub provider: ProviderKind,

    /// Provider-side model name (e.g. "gpt-4o", "claude-sonnet-4-20250514")
    pub model_name: String,

    /// Environment variable holding the API key
    pub env_key: String,

    /// Base URL override; required for `openai_compatible`.
    /// Values can contain ${ENV_VAR} for environment variable expansion
    #[serde(default)]
    pub base_url: Option<String>,

    /// Maximum tokens per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: f64,
}

fn default_max_tokens() -> u32 {
    1024
}

impl ModelSpec {
    /// Resolve the API key from the environment.
    pub fn resolve_api_key(&self, model_key: &str) -> Result<String, ConfigError> {
        match std::env::var(&self.env_key) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConfigError::MissingApiKey {
                model: model_key.to_string(),
                env_var: self.env_key.clone(),
            }),
        }
    }

    /// Base URL with environment variables expanded.
    pub fn expanded_base_url(&self) -> Option<String> {
        self.base_url.as_deref().map(expand_env_vars)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a model by its logical key.
    pub fn model(&self, key: &str) -> Result<&ModelSpec, ConfigError> {
        self.models
            .get(key)
            .ok_or_else(|| ConfigError::ModelNotFound(key.to_string()))
    }

    /// Path of the job store file.
    pub fn jobs_file(&self) -> PathBuf {
        self.batch
            .metadata_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("batch_jobs.json"))
    }

    /// Check structural requirements that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, spec) in &self.models {
            if spec.provider == ProviderKind::OpenAiCompatible && spec.base_url.is_none() {
                return Err(ConfigError::MissingBaseUrl(key.clone()));
            }
        }
        if self.batch.poll_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "batch.poll_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key for model '{model}': set the {env_var} env var")]
    MissingApiKey { model: String, env_var: String },

    #[error("Model not found: '{0}' (not configured in [models.*])")]
    ModelNotFound(String),

    #[error("Model '{0}' uses provider openai_compatible but has no base_url")]
    MissingBaseUrl(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
queries = "data/queries.json"

[models.gpt]
provider = "openai"
model_name = "gpt-4o"
env_key = "QB_TEST_OPENAI_KEY"

[models.qwen]
provider = "openai_compatible"
model_name = "qwen-plus"
env_key = "QB_TEST_QWEN_KEY"
base_url = "https://dashscope.example.com/v1"
max_tokens = 2048
"#;

    #[test]
    fn parses_models_and_applies_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("raw_outputs"));
        assert_eq!(config.jobs_file(), PathBuf::from("raw_outputs/batch_jobs.json"));
        assert_eq!(config.batch.poll_concurrency, 4);

        let gpt = config.model("gpt").unwrap();
        assert_eq!(gpt.provider, ProviderKind::OpenAi);
        assert_eq!(gpt.max_tokens, 1024);
        assert_eq!(gpt.temperature, 0.0);

        let qwen = config.model("qwen").unwrap();
        assert_eq!(qwen.provider, ProviderKind::OpenAiCompatible);
        assert_eq!(qwen.max_tokens, 2048);
    }

    #[test]
    fn unknown_model_is_reported() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert!(matches!(
            config.model("llama"),
            Err(ConfigError::ModelNotFound(key)) if key == "llama"
        ));
    }

    #[test]
    fn compatible_provider_requires_base_url() {
        let toml = r#"
queries = "q.json"
[models.local]
provider = "openai_compatible"
model_name = "llama3"
env_key = "LOCAL_KEY"
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(ConfigError::MissingBaseUrl(key)) if key == "local"
        ));
    }

    #[test]
    fn missing_env_key_is_an_error() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let spec = config.model("gpt").unwrap();
        assert!(matches!(
            spec.resolve_api_key("gpt"),
            Err(ConfigError::MissingApiKey { env_var, .. }) if env_var == "QB_TEST_OPENAI_KEY"
        ));
    }

    #[test]
    fn unset_variables_are_left_in_place() {
        assert_eq!(
            expand_env_vars("https://${QB_TEST_SURELY_UNSET_VAR}/v1"),
            "https://${QB_TEST_SURELY_UNSET_VAR}/v1"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
    }
}

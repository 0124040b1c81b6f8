//! Prompt assembly and query loading.
//!
//! Produces the payload set the dispatcher submits and the normalizer joins
//! against. Both commands rebuild it the same way from the same inputs, so
//! correlation ids always line up.

use crate::models::{BatchError, Config, Payload, QueryItem, Result};
use std::path::Path;
use tracing::{info, warn};

/// Sentence in the template that is replaced with each question.
pub const PLACEHOLDER: &str =
    "Find all compositions in DIAMM that are composed by Guillaume de Machaut";

const FALLBACK_TEMPLATE: &str = "I have a graph database containing musical linked data.
Please write me a SPARQL query to perform the following query:
Find all compositions in DIAMM that are composed by Guillaume de Machaut
Return only the query, in a ```sparql code block.";

/// Builds system prompts from a template and an ontology text.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
    ontology: String,
}

impl PromptBuilder {
    pub fn new(template: impl Into<String>, ontology: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ontology: ontology.into(),
        }
    }

    /// Load the template and ontology named in the config.
    ///
    /// A missing template falls back to the built-in one; a missing ontology is empty.
    pub fn from_config(config: &Config) -> Result<Self> {
        let template = match read_optional(&config.prompt.system_prompt)? {
            Some(text) => text,
            None => {
                warn!(
                    path = %config.prompt.system_prompt.display(),
                    "System prompt not found, using built-in template"
                );
                FALLBACK_TEMPLATE.to_string()
            }
        };
        let ontology = match read_optional(&config.prompt.ontology_file)? {
            Some(text) => text,
            None => {
                warn!(
                    path = %config.prompt.ontology_file.display(),
                    "Ontology file not found, prompts will carry no definitions"
                );
                String::new()
            }
        };
        Ok(Self::new(template, ontology))
    }

    /// Ontology text appended to every prompt.
    pub fn ontology(&self) -> &str {
        &self.ontology
    }

    /// System prompt for one question.
    pub fn build(&self, nl_query: &str) -> String {
        let mut prompt = if self.template.contains(PLACEHOLDER) {
            self.template.replace(PLACEHOLDER, nl_query)
        } else {
            format!("{}\n\nPlease write a SPARQL query for: {nl_query}", self.template)
        };
        prompt.push_str("\n\nOntology Definitions:\n");
        prompt.push_str(&self.ontology);
        prompt
    }

    /// One payload per query item, in file order.
    pub fn payloads(&self, items: &[QueryItem]) -> Vec<Payload> {
        items
            .iter()
            .map(|item| Payload {
                id: item.id.clone(),
                system_prompt: self.build(&item.query),
                user_query: item.query.clone(),
                ground_truth: item.ground_truth_sparql.clone(),
            })
            .collect()
    }
}

/// Read the query file (a JSON array of query items).
pub fn load_queries(path: &Path) -> Result<Vec<QueryItem>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BatchError::io(format!("reading query file {}", path.display()), e))?;
    let items: Vec<QueryItem> = serde_json::from_str(&content)
        .map_err(|e| BatchError::ParseError(format!("{}: {e}", path.display())))?;

    info!(count = items.len(), path = %path.display(), "Loaded queries");
    Ok(items)
}

/// Keep the items whose target databases mention `database`.
pub fn filter_by_database(items: Vec<QueryItem>, database: &str) -> Vec<QueryItem> {
    let before = items.len();
    let kept: Vec<QueryItem> = items
        .into_iter()
        .filter(|item| {
            item.target_databases
                .as_deref()
                .is_some_and(|dbs| dbs.contains(database))
        })
        .collect();

    info!(before, after = kept.len(), filter = %database, "Filtered queries");
    kept
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BatchError::io(format!("reading {}", path.display()), e)),
    }
}

//! Payload, query and canonical result types.
//!
//! Correlation ids are always strings. Numeric ids in the query file are
//! converted to their decimal text on load, so joins are plain string equality.

use serde::{Deserialize, Deserializer, Serialize};

/// One unit of work submitted inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Correlation id echoed back by the provider
    pub id: String,
    pub system_prompt: String,
    pub user_query: String,
    /// Reference query carried through to the canonical record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<String>,
}

/// One entry of the query file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryItem {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,

    /// Natural-language question
    pub query: String,

    #[serde(default)]
    pub ground_truth_sparql: Option<String>,

    /// Free-text list of databases the question targets
    #[serde(default)]
    pub target_databases: Option<String>,
}

/// Provider-independent output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub query: String,
    pub model: String,
    pub generated_text: String,
    pub ground_truth: Option<String>,
    pub raw_response: String,
}

fn id_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Integer(n) => n.to_string(),
        RawId::Float(f) => f.to_string(),
    })
}

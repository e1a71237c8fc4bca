//! Physical request and response bodies of a batch.
//!
//! One [`BatchRequest`] carries every logical query of a burst, each tagged
//! with the key its result comes back under. The runtime answers per key with
//! either a result or an error, so one failing statistic does not sink its
//! siblings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Aggregate request sent for one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Backend instance (session) the queries run against
    pub instance_id: String,
    pub queries: Vec<BatchQuery>,
}

/// One logical query inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchQuery {
    /// Key the result is returned under
    pub key: String,
    pub query: Value,
}

/// Aggregate response for one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub results: Vec<BatchResult>,
}

/// Result of one logical query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    pub fn ok(key: impl Into<String>, result: Value) -> Self {
        Self {
            key: key.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

impl BatchResponse {
    pub fn new(results: Vec<BatchResult>) -> Self {
        Self { results }
    }

    /// Index results by key; the last result wins for a repeated key
    pub fn into_map(self) -> HashMap<String, BatchResult> {
        self.results
            .into_iter()
            .map(|result| (result.key.clone(), result))
            .collect()
    }
}

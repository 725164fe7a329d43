//! Parsing of the stdout output contract.
//!
//! A command that declares outputs prints them as JSON on stdout, either a
//! single `{ "id": ..., "value": ... }` object or an array of them. Empty
//! stdout means no outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RunnerError, RunnerResult};

/// One output reported by a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub id: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OutputDocument {
    Many(Vec<OutputValue>),
    One(OutputValue),
}

/// Parse the stdout of `command` into output values keyed by id.
pub fn parse_outputs(command: &str, stdout: &str) -> RunnerResult<BTreeMap<String, String>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }
    let document: OutputDocument =
        serde_json::from_str(trimmed).map_err(|e| RunnerError::InvalidOutput {
            command: command.to_string(),
            message: e.to_string(),
        })?;
    let values = match document {
        OutputDocument::Many(values) => values,
        OutputDocument::One(value) => vec![value],
    };
    Ok(values
        .into_iter()
        .map(|output| {
            let text = match output.value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (output.id, text)
        })
        .collect())
}

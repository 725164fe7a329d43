//! JSON Schema validation of repository documents.

use std::collections::HashMap;
use std::fmt;

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use tracing::debug;

use crate::error::{ErrorDetail, TemplateError, TemplateResult};
use crate::source::JsonDocument;

/// Document kinds with a bundled schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaKind {
    Application,
    Template,
    Addon,
}

impl SchemaKind {
    pub const ALL: [SchemaKind; 3] = [Self::Application, Self::Template, Self::Addon];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Template => "template",
            Self::Addon => "addon",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            Self::Application => include_str!("../schemas/application.schema.json"),
            Self::Template => include_str!("../schemas/template.schema.json"),
            Self::Addon => include_str!("../schemas/addon.schema.json"),
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validates a parsed document against the schema for its kind.
#[cfg_attr(test, mockall::automock)]
pub trait DocumentValidator: Send + Sync {
    /// Every violation, each located in the document's source file.
    fn validate(&self, document: &JsonDocument, kind: SchemaKind) -> Vec<ErrorDetail>;
}

/// [`DocumentValidator`] backed by the bundled schemas.
pub struct SchemaValidator {
    schemas: HashMap<SchemaKind, JSONSchema>,
}

impl SchemaValidator {
    /// Compile all bundled schemas.
    pub fn new() -> TemplateResult<Self> {
        let mut schemas = HashMap::new();
        for kind in SchemaKind::ALL {
            let schema: Value = serde_json::from_str(kind.source())?;
            let compiled = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&schema)
                .map_err(|e| TemplateError::InvalidSchema {
                    schema: kind.to_string(),
                    message: e.to_string(),
                })?;
            schemas.insert(kind, compiled);
        }
        debug!("Compiled {} document schemas", schemas.len());
        Ok(Self { schemas })
    }
}

impl DocumentValidator for SchemaValidator {
    fn validate(&self, document: &JsonDocument, kind: SchemaKind) -> Vec<ErrorDetail> {
        let Some(schema) = self.schemas.get(&kind) else {
            return vec![ErrorDetail::new(format!("No schema registered for {}", kind))];
        };
        match schema.validate(&document.value) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| {
                    let pointer = error.instance_path.to_string();
                    let location = if pointer.is_empty() { "/" } else { pointer.as_str() };
                    document.detail_at(
                        &pointer,
                        format!("Schema violation ({}) at {}: {}", kind, location, error),
                    )
                })
                .collect(),
        }
    }
}

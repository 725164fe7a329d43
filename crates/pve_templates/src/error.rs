//! Error types for template resolution.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::application::ApplicationSummary;

/// Result type alias for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur while loading documents.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("{0}")]
    Invalid(ErrorDetail),

    #[error("Invalid bundled schema {schema}: {message}")]
    InvalidSchema { schema: String, message: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TemplateError {
    /// Convert into a detail entry, attributing it to `file` when the
    /// error does not already carry a location.
    pub fn into_detail(self, file: &Path) -> ErrorDetail {
        match self {
            Self::Invalid(detail) => detail,
            Self::Configuration(error) => ErrorDetail::new(error.message).with_details(error.details),
            Self::Json(error) => ErrorDetail::new(format!("Invalid JSON: {}", error))
                .at(file, (error.line() > 0).then(|| error.line())),
            other => ErrorDetail::new(other.to_string()).at(file, None),
        }
    }
}

/// One entry in a configuration error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            line: None,
            details: Vec::new(),
        }
    }

    /// Attach a source location (1-based line).
    pub fn at(mut self, file: impl Into<PathBuf>, line: Option<usize>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    /// `file:line` when known.
    pub fn location(&self) -> Option<String> {
        let file = self.file.as_ref()?;
        Some(match self.line {
            Some(line) => format!("{}:{}", file.display(), line),
            None => file.display().to_string(),
        })
    }

    fn render_into(&self, indent: usize, out: &mut String) {
        out.push_str(&"  ".repeat(indent));
        out.push_str("- ");
        out.push_str(&self.message);
        if let Some(location) = self.location() {
            out.push_str(&format!(" ({})", location));
        }
        out.push('\n');
        for detail in &self.details {
            detail.render_into(indent + 1, out);
        }
    }

    fn collect_messages(&self, out: &mut Vec<String>) {
        out.push(self.message.clone());
        for detail in &self.details {
            detail.collect_messages(out);
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location() {
            Some(location) => write!(f, "{} ({})", self.message, location),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Aggregate error raised when an application cannot be resolved.
///
/// Carries every problem found during one resolution pass plus whatever part
/// of the application did resolve, so callers can show both.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationError {
    pub message: String,
    pub details: Vec<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<Box<ApplicationSummary>>,
}

impl ConfigurationError {
    pub fn new(message: impl Into<String>, details: Vec<ErrorDetail>) -> Self {
        Self {
            message: message.into(),
            details,
            application: None,
        }
    }

    pub fn with_application(mut self, application: ApplicationSummary) -> Self {
        self.application = Some(Box::new(application));
        self
    }

    /// Message followed by indented detail lines, one per nesting level.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n", self.message);
        for detail in &self.details {
            detail.render_into(1, &mut out);
        }
        out
    }

    /// All detail messages, depth first.
    pub fn messages(&self) -> Vec<String> {
        let mut out = Vec::new();
        for detail in &self.details {
            detail.collect_messages(&mut out);
        }
        out
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} error(s))", self.message, self.details.len())
    }
}

impl std::error::Error for ConfigurationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_nests_details() {
        let error = ConfigurationError::new(
            "Application demo has 1 configuration error(s)",
            vec![ErrorDetail::new("Template install.json could not be loaded")
                .with_details(vec![ErrorDetail::new("Template file not found: install.json")
                    .at("/srv/json/shared/templates", None)])],
        );

        let rendered = error.render();
        assert!(rendered.starts_with("Application demo has 1"));
        assert!(rendered.contains("\n  - Template install.json could not be loaded\n"));
        assert!(rendered.contains("\n    - Template file not found: install.json (/srv/json/shared/templates)"));
        assert_eq!(error.messages().len(), 2);
    }

    #[test]
    fn test_detail_location() {
        let detail = ErrorDetail::new("bad").at("app.json", Some(7));
        assert_eq!(detail.location().as_deref(), Some("app.json:7"));
        assert_eq!(detail.to_string(), "bad (app.json:7)");
    }
}

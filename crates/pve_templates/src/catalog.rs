//! Explicitly owned access point to repository documents.
//!
//! A [`Catalog`] bundles the repository layout, the document cache and the
//! schema validator. Loader, addon service and processor all borrow one
//! catalog; nothing is kept in module-level state, so tests can run many
//! catalogs side by side.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::DocumentCache;
use crate::error::{ErrorDetail, TemplateResult};
use crate::model::Template;
use crate::repository::{template_file_name, ApplicationId, Repository};
use crate::schema::{DocumentValidator, SchemaKind, SchemaValidator};
use crate::source::JsonDocument;

/// A template document together with its parsed form.
#[derive(Debug, Clone)]
pub struct LoadedTemplate {
    /// Name as referenced.
    pub reference: String,
    pub document: Arc<JsonDocument>,
    pub template: Template,
}

pub struct Catalog {
    repository: Repository,
    cache: Arc<DocumentCache>,
    validator: Arc<dyn DocumentValidator>,
}

impl Catalog {
    pub fn new(
        repository: Repository,
        cache: Arc<DocumentCache>,
        validator: Arc<dyn DocumentValidator>,
    ) -> Self {
        Self {
            repository,
            cache,
            validator,
        }
    }

    /// Catalog over two roots with a fresh cache and the bundled schemas.
    pub fn open(local_root: impl Into<PathBuf>, json_root: impl Into<PathBuf>) -> TemplateResult<Self> {
        Ok(Self::new(
            Repository::new(local_root, json_root),
            Arc::new(DocumentCache::new()),
            Arc::new(SchemaValidator::new()?),
        ))
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    /// Load `path` through the cache and validate it against `kind`.
    pub fn load_document(
        &self,
        path: &std::path::Path,
        kind: SchemaKind,
    ) -> Result<Arc<JsonDocument>, Vec<ErrorDetail>> {
        let document = self
            .cache
            .load(path)
            .map_err(|e| vec![e.into_detail(path)])?;
        let errors = self.validator.validate(&document, kind);
        if errors.is_empty() {
            Ok(document)
        } else {
            Err(errors)
        }
    }

    /// Find, load, validate and parse a template visible to `hierarchy`.
    pub fn load_template(
        &self,
        name: &str,
        hierarchy: &[ApplicationId],
    ) -> Result<LoadedTemplate, Vec<ErrorDetail>> {
        let Some(path) = self.repository.find_template(name, hierarchy) else {
            let searched = self
                .repository
                .template_dirs(hierarchy)
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(vec![ErrorDetail::new(format!(
                "Template file not found: {} (searched {})",
                template_file_name(name),
                searched
            ))]);
        };
        let document = self.load_document(&path, SchemaKind::Template)?;
        let template: Template = document.deserialize().map_err(|e| vec![e])?;
        Ok(LoadedTemplate {
            reference: name.to_string(),
            document,
            template,
        })
    }
}

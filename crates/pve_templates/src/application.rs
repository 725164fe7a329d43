//! Application loading and `extends` resolution.
//!
//! An application may extend another one. The loader walks the chain from the
//! requested application up to its root, then merges each task's template
//! references root first, so a child can position its own templates relative
//! to the ones it inherits.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{ConfigurationError, ErrorDetail};
use crate::model::{Application, Parameter, Phase, PhaseTemplates, Task};
use crate::repository::{ApplicationId, Layer};
use crate::schema::SchemaKind;
use crate::source::JsonDocument;

/// What a listing shows for one application, broken or not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplicationSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDetail>,
}

/// One application of an `extends` chain.
#[derive(Debug, Clone)]
struct ChainLink {
    id: ApplicationId,
    application: Application,
    document: Arc<JsonDocument>,
}

/// An application with its inheritance applied for one task.
#[derive(Debug, Clone)]
pub struct ResolvedApplication {
    /// Layer-qualified id of the requested application.
    pub id: ApplicationId,
    pub application: Application,
    pub task_templates: PhaseTemplates,
    /// Requested application first, root last.
    pub hierarchy: Vec<ApplicationId>,
    /// Application-level parameters across the chain, child declarations first.
    pub parameters: Vec<Parameter>,
    pub errors: Vec<ErrorDetail>,
}

impl ResolvedApplication {
    pub fn summary(&self) -> ApplicationSummary {
        ApplicationSummary {
            id: self.application.id.clone(),
            name: self.application.name.clone(),
            description: self.application.description.clone(),
            tags: self.application.tags.clone(),
            extends: self.application.extends.clone(),
            errors: self.errors.clone(),
        }
    }
}

/// Reads applications through a [`Catalog`].
pub struct ApplicationLoader<'a> {
    catalog: &'a Catalog,
}

impl<'a> ApplicationLoader<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Resolve `id` and merge its template references for `task`.
    ///
    /// Every problem found along the way is reported together in one
    /// [`ConfigurationError`].
    pub fn read_application(
        &self,
        id: &str,
        task: &Task,
    ) -> Result<ResolvedApplication, ConfigurationError> {
        let requested = ApplicationId::parse(id);
        let (chain, mut errors) = self.resolve_chain(&requested);

        let Some(first) = chain.first() else {
            return Err(ConfigurationError::new(
                format!("Application {} could not be loaded", requested),
                errors,
            )
            .with_application(ApplicationSummary {
                id: requested.name.clone(),
                name: requested.name.clone(),
                ..Default::default()
            }));
        };

        let hierarchy: Vec<ApplicationId> = chain.iter().map(|link| link.id.clone()).collect();

        let mut task_templates = PhaseTemplates::default();
        for link in chain.iter().rev() {
            match link.application.task_templates(task) {
                Ok(Some(own)) => {
                    self.check_templates_exist(link, task, &own, &hierarchy, &mut errors);
                    task_templates = task_templates.merged(&own);
                }
                Ok(None) => {}
                Err(detail) => errors.push(
                    link.document
                        .detail_at(&format!("/{}", task), detail.message),
                ),
            }
        }
        if task_templates.is_empty() {
            debug!("Application {} declares no templates for task {}", requested, task);
        }

        let mut parameters: Vec<Parameter> = Vec::new();
        for link in &chain {
            for parameter in &link.application.parameters {
                if !parameters.iter().any(|p| p.id == parameter.id) {
                    parameters.push(parameter.clone());
                }
            }
        }

        let resolved = ResolvedApplication {
            id: first.id.clone(),
            application: first.application.clone(),
            task_templates,
            hierarchy,
            parameters,
            errors,
        };

        if resolved.errors.is_empty() {
            info!(
                "Resolved application {} for task {} ({} template(s))",
                resolved.id,
                task,
                resolved.task_templates.len()
            );
            Ok(resolved)
        } else {
            Err(ConfigurationError::new(
                format!(
                    "Application {} has {} configuration error(s)",
                    requested,
                    resolved.errors.len()
                ),
                resolved.errors.clone(),
            )
            .with_application(resolved.summary()))
        }
    }

    /// Summaries of every application in both layers.
    ///
    /// A broken application is listed with its errors instead of failing the
    /// whole listing.
    pub fn list_applications(&self) -> Vec<ApplicationSummary> {
        self.catalog
            .repository()
            .list_application_ids()
            .into_iter()
            .map(|name| {
                let (chain, errors) = self.resolve_chain(&ApplicationId::parse(&name));
                match chain.first() {
                    Some(link) => ApplicationSummary {
                        id: name,
                        name: link.application.name.clone(),
                        description: link.application.description.clone(),
                        tags: link.application.tags.clone(),
                        extends: link.application.extends.clone(),
                        errors,
                    },
                    None => ApplicationSummary {
                        name: name.clone(),
                        id: name,
                        errors,
                        ..Default::default()
                    },
                }
            })
            .collect()
    }

    /// Walk the `extends` chain starting at `start`.
    ///
    /// Stops at the first link that cannot be loaded, at a missing parent or
    /// at a cycle; the links read so far are returned with the errors.
    fn resolve_chain(&self, start: &ApplicationId) -> (Vec<ChainLink>, Vec<ErrorDetail>) {
        let repository = self.catalog.repository();
        let mut chain: Vec<ChainLink> = Vec::new();
        let mut errors = Vec::new();

        let Some(mut current) = repository.find_application(start) else {
            errors.push(ErrorDetail::new(format!("Application not found: {}", start)));
            return (chain, errors);
        };

        loop {
            let (layer, path) = current;
            let link = match self.load_link(layer, &path) {
                Ok(link) => link,
                Err(mut details) => {
                    errors.append(&mut details);
                    break;
                }
            };

            let Some(parent) = parent_reference(&link) else {
                chain.push(link);
                break;
            };

            let Some((parent_layer, parent_path)) = repository.find_application(&parent) else {
                errors.push(link.document.detail_at(
                    "/extends",
                    format!(
                        "Application {} extends {} which does not exist",
                        link.id, parent
                    ),
                ));
                chain.push(link);
                break;
            };

            let parent_id = ApplicationId::qualified(parent_layer, parent.name.clone());
            let on_stack = parent_id == link.id || chain.iter().any(|l| l.id == parent_id);
            if on_stack {
                let path_text = chain
                    .iter()
                    .map(|l| l.id.to_string())
                    .chain([link.id.to_string(), parent_id.to_string()])
                    .collect::<Vec<_>>()
                    .join(" -> ");
                errors.push(
                    link.document
                        .detail_at("/extends", format!("Cyclic extends detected: {}", path_text)),
                );
                chain.push(link);
                break;
            }

            chain.push(link);
            current = (parent_layer, parent_path);
        }

        (chain, errors)
    }

    fn load_link(&self, layer: Layer, path: &std::path::Path) -> Result<ChainLink, Vec<ErrorDetail>> {
        let document = self.catalog.load_document(path, SchemaKind::Application)?;
        let mut application: Application = document.deserialize().map_err(|e| vec![e])?;
        let name = path
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| application.name.clone());
        application.id = name.clone();
        Ok(ChainLink {
            id: ApplicationId::qualified(layer, name),
            application,
            document,
        })
    }

    fn check_templates_exist(
        &self,
        link: &ChainLink,
        task: &Task,
        own: &PhaseTemplates,
        hierarchy: &[ApplicationId],
        errors: &mut Vec<ErrorDetail>,
    ) {
        for phase in Phase::ALL {
            for (index, entry) in own.get(phase).iter().enumerate() {
                if self
                    .catalog
                    .repository()
                    .find_template(entry.name(), hierarchy)
                    .is_none()
                {
                    errors.push(link.document.detail_at(
                        &link.application.task_pointer(task, phase, index),
                        format!("Template file not found: {}", entry.name()),
                    ));
                }
            }
        }
    }
}

/// Parent an application extends, with the same-name rule applied.
///
/// A local override extending its own name means the shipped application it
/// shadows.
fn parent_reference(link: &ChainLink) -> Option<ApplicationId> {
    let extends = link.application.extends.as_deref()?;
    let parent = ApplicationId::parse(extends);
    if parent.layer.is_none() && link.id.layer == Some(Layer::Local) && parent.name == link.id.name {
        return Some(ApplicationId::qualified(Layer::Json, parent.name));
    }
    Some(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn setup() -> (TempDir, Catalog) {
        let temp = tempdir().unwrap();
        let catalog = Catalog::open(temp.path().join("local"), temp.path().join("json")).unwrap();
        for name in ["x", "y", "z"] {
            write(
                &temp.path().join(format!("json/shared/templates/{}.json", name)),
                &format!(r#"{{"name": "{}", "commands": []}}"#, name),
            );
        }
        (temp, catalog)
    }

    fn names(list: &[crate::model::TemplateRef]) -> Vec<&str> {
        list.iter().map(|t| t.name()).collect()
    }

    #[test]
    fn test_child_inserts_before_parent_template() {
        let (temp, catalog) = setup();
        write(
            &temp.path().join("json/applications/a/application.json"),
            r#"{"name": "A", "installation": {"pre_start": ["x", "y"]}}"#,
        );
        write(
            &temp.path().join("json/applications/b/application.json"),
            r#"{"name": "B", "extends": "a", "installation": {"pre_start": [{"name": "z", "before": "y"}]}}"#,
        );

        let resolved = ApplicationLoader::new(&catalog)
            .read_application("b", &Task::Installation)
            .unwrap();
        assert_eq!(names(&resolved.task_templates.pre_start), vec!["x", "z", "y"]);
        assert_eq!(
            resolved.hierarchy,
            vec![
                ApplicationId::qualified(Layer::Json, "b"),
                ApplicationId::qualified(Layer::Json, "a")
            ]
        );
    }

    #[test]
    fn test_cycle_reports_path_and_line() {
        let (temp, catalog) = setup();
        write(
            &temp.path().join("json/applications/a/application.json"),
            "{\n  \"name\": \"A\",\n  \"extends\": \"b\"\n}",
        );
        write(
            &temp.path().join("json/applications/b/application.json"),
            "{\n  \"name\": \"B\",\n  \"extends\": \"a\"\n}",
        );

        let err = ApplicationLoader::new(&catalog)
            .read_application("a", &Task::Installation)
            .unwrap_err();
        assert_eq!(err.details.len(), 1);
        assert_eq!(
            err.details[0].message,
            "Cyclic extends detected: json:a -> json:b -> json:a"
        );
        assert_eq!(err.details[0].line, Some(3));
        assert_eq!(err.application.as_ref().unwrap().name, "A");
    }

    #[test]
    fn test_missing_template_is_located() {
        let (temp, catalog) = setup();
        write(
            &temp.path().join("json/applications/a/application.json"),
            "{\n  \"name\": \"A\",\n  \"backup\": [\n    \"x\",\n    \"gone\"\n  ]\n}",
        );

        let err = ApplicationLoader::new(&catalog)
            .read_application("a", &Task::Backup)
            .unwrap_err();
        assert_eq!(err.details[0].message, "Template file not found: gone");
        assert_eq!(err.details[0].line, Some(5));
    }

    #[test]
    fn test_listing_survives_broken_application() {
        let (temp, catalog) = setup();
        write(
            &temp.path().join("json/applications/good/application.json"),
            r#"{"name": "Good", "tags": ["web"]}"#,
        );
        write(&temp.path().join("json/applications/bad/application.json"), "{ nope");

        let listing = ApplicationLoader::new(&catalog).list_applications();
        assert_eq!(listing.len(), 2);
        let bad = listing.iter().find(|s| s.id == "bad").unwrap();
        assert_eq!(bad.errors.len(), 1);
        let good = listing.iter().find(|s| s.id == "good").unwrap();
        assert!(good.errors.is_empty());
        assert_eq!(good.tags, vec!["web".to_string()]);
    }

    #[test]
    fn test_child_parameters_shadow_parent() {
        let (temp, catalog) = setup();
        write(
            &temp.path().join("json/applications/a/application.json"),
            r#"{"name": "A", "parameters": [{"id": "port", "default": 80}, {"id": "host"}]}"#,
        );
        write(
            &temp.path().join("local/applications/a/application.json"),
            r#"{"name": "A local", "extends": "a", "parameters": [{"id": "port", "default": 8080}]}"#,
        );

        let resolved = ApplicationLoader::new(&catalog)
            .read_application("a", &Task::Installation)
            .unwrap();
        assert_eq!(resolved.application.name, "A local");
        let ids: Vec<&str> = resolved.parameters.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["port", "host"]);
        assert_eq!(resolved.parameters[0].default_text().as_deref(), Some("8080"));
    }
}

//! Addon loading, compatibility and template splicing.

use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::error::{ErrorDetail, TemplateError, TemplateResult};
use crate::model::{merge_template_refs, Addon, Application, CompatibleWith, Parameter, Phase, TemplateRef};
use crate::repository::ApplicationId;
use crate::schema::SchemaKind;

/// Whether `addon` may be installed into `application`.
///
/// Criteria match the application id or name, the application it extends
/// (with any `json:` qualifier dropped), or `tag:<t>` against its tags.
pub fn is_addon_compatible(addon: &Addon, application: &Application) -> bool {
    let criteria = match &addon.compatible_with {
        CompatibleWith::All => return true,
        CompatibleWith::Only(criteria) => criteria,
    };
    let extends = application
        .extends
        .as_deref()
        .map(|e| ApplicationId::parse(e).name);
    criteria.iter().any(|criterion| match criterion.strip_prefix("tag:") {
        Some(tag) => application.has_tag(tag),
        None => {
            criterion == &application.id
                || criterion == &application.name
                || extends.as_deref() == Some(criterion.as_str())
        }
    })
}

/// `base` with the addon's references for `phase` applied.
pub fn merge_addon_templates(base: &[TemplateRef], addon: &Addon, phase: Phase) -> Vec<TemplateRef> {
    let additions = addon.templates.get(phase);
    if additions.is_empty() {
        return base.to_vec();
    }
    merge_template_refs(base, additions)
}

/// Addon access on top of a [`Catalog`].
pub struct AddonService<'a> {
    catalog: &'a Catalog,
}

impl<'a> AddonService<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Load an addon by id. A missing file is `Ok(None)`.
    pub fn load_addon(&self, id: &str) -> TemplateResult<Option<Addon>> {
        let Some(path) = self.catalog.repository().addon_path(id) else {
            debug!("Addon {} not installed, skipping", id);
            return Ok(None);
        };
        let document = self
            .catalog
            .load_document(&path, SchemaKind::Addon)
            .map_err(|details| invalid(id, details))?;
        let mut addon: Addon = document
            .deserialize()
            .map_err(|detail| invalid(id, vec![detail]))?;
        addon.id = id.to_string();
        Ok(Some(addon))
    }

    /// Every installed addon that loads cleanly.
    pub fn list_addons(&self) -> Vec<Addon> {
        self.catalog
            .repository()
            .list_addon_ids()
            .into_iter()
            .filter_map(|id| match self.load_addon(&id) {
                Ok(addon) => addon,
                Err(e) => {
                    warn!("Skipping addon {}: {}", id, e);
                    None
                }
            })
            .collect()
    }

    pub fn compatible_addons(&self, application: &Application) -> Vec<Addon> {
        self.list_addons()
            .into_iter()
            .filter(|addon| is_addon_compatible(addon, application))
            .collect()
    }

    /// Parameters an addon asks the user for.
    ///
    /// Addons that declare `parameters` use those. Older addons declare them
    /// only in their templates, so those are scanned across all phases, first
    /// declaration of an id winning. `parameterOverrides` then rename
    /// parameters that exist; overrides for unknown ids are ignored.
    pub fn extract_addon_parameters(
        &self,
        addon: &Addon,
        hierarchy: &[ApplicationId],
    ) -> Result<Vec<Parameter>, Vec<ErrorDetail>> {
        let mut parameters: Vec<Parameter> = if addon.parameters.is_empty() {
            let mut scanned: Vec<Parameter> = Vec::new();
            for phase in Phase::ALL {
                for entry in addon.templates.get(phase) {
                    let loaded = self.catalog.load_template(entry.name(), hierarchy)?;
                    for parameter in loaded.template.parameters {
                        if !scanned.iter().any(|p| p.id == parameter.id) {
                            scanned.push(Parameter {
                                templatename: Some(loaded.template.name.clone()),
                                ..parameter
                            });
                        }
                    }
                }
            }
            scanned
        } else {
            addon.parameters.clone()
        };

        for rename in &addon.parameter_overrides {
            if let Some(parameter) = parameters.iter_mut().find(|p| p.id == rename.id) {
                if let Some(name) = &rename.name {
                    parameter.name = name.clone();
                }
                if let Some(description) = &rename.description {
                    parameter.description = Some(description.clone());
                }
            }
        }
        Ok(parameters)
    }
}

fn invalid(id: &str, details: Vec<ErrorDetail>) -> TemplateError {
    TemplateError::Invalid(ErrorDetail::new(format!("Addon {} is invalid", id)).with_details(details))
}

//! On-disk layout of the local override layer and the shared json layer.
//!
//! Both roots share one layout:
//!
//! ```text
//! applications/<id>/application.json
//! applications/<id>/templates/*.json
//! applications/<id>/scripts/**
//! shared/templates/*.json
//! shared/scripts/{pre_start,post_start,upgrade,library}/
//! addons/<id>.json
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::model::Phase;

/// Storage layer an application or template lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Site-local overrides.
    Local,
    /// Shipped definitions.
    Json,
}

impl Layer {
    /// Search order for unqualified lookups.
    pub const SEARCH_ORDER: [Layer; 2] = [Layer::Local, Layer::Json];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Application reference, optionally pinned to a layer (`json:<name>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationId {
    pub layer: Option<Layer>,
    pub name: String,
}

impl ApplicationId {
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some(("json", name)) => Self::qualified(Layer::Json, name),
            Some(("local", name)) => Self::qualified(Layer::Local, name),
            _ => Self {
                layer: None,
                name: s.to_string(),
            },
        }
    }

    pub fn qualified(layer: Layer, name: impl Into<String>) -> Self {
        Self {
            layer: Some(layer),
            name: name.into(),
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layer {
            Some(layer) => write!(f, "{}:{}", layer, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// File name for a template reference; `.json` is implied.
pub fn template_file_name(name: &str) -> String {
    if name.ends_with(".json") {
        name.to_string()
    } else {
        format!("{}.json", name)
    }
}

/// The two repository roots.
#[derive(Debug, Clone)]
pub struct Repository {
    local_root: PathBuf,
    json_root: PathBuf,
}

impl Repository {
    pub fn new(local_root: impl Into<PathBuf>, json_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            json_root: json_root.into(),
        }
    }

    pub fn root(&self, layer: Layer) -> &Path {
        match layer {
            Layer::Local => &self.local_root,
            Layer::Json => &self.json_root,
        }
    }

    fn layers_for(id: &ApplicationId) -> Vec<Layer> {
        match id.layer {
            Some(layer) => vec![layer],
            None => Layer::SEARCH_ORDER.to_vec(),
        }
    }

    pub fn application_dir(&self, layer: Layer, name: &str) -> PathBuf {
        self.root(layer).join("applications").join(name)
    }

    /// Locate `application.json`, local layer first unless pinned.
    pub fn find_application(&self, id: &ApplicationId) -> Option<(Layer, PathBuf)> {
        Self::layers_for(id).into_iter().find_map(|layer| {
            let path = self.application_dir(layer, &id.name).join("application.json");
            path.is_file().then_some((layer, path))
        })
    }

    /// Names of all applications across both layers, sorted.
    pub fn list_application_ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for layer in Layer::SEARCH_ORDER {
            let dir = self.root(layer).join("applications");
            if !dir.exists() {
                debug!("No applications directory in {} layer: {:?}", layer, dir);
                continue;
            }
            for entry in WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.path().join("application.json").is_file() {
                    ids.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        ids.into_iter().collect()
    }

    /// Directories searched for templates of `hierarchy`, most specific first.
    pub fn template_dirs(&self, hierarchy: &[ApplicationId]) -> Vec<PathBuf> {
        self.search_dirs(hierarchy, "templates", &[])
    }

    /// Directories searched for scripts used in `phase`.
    pub fn script_dirs(&self, hierarchy: &[ApplicationId], phase: Phase) -> Vec<PathBuf> {
        self.search_dirs(hierarchy, "scripts", &[phase.as_str(), "library"])
    }

    fn search_dirs(&self, hierarchy: &[ApplicationId], kind: &str, subdirs: &[&str]) -> Vec<PathBuf> {
        let mut bases = Vec::new();
        for id in hierarchy {
            for layer in Self::layers_for(id) {
                bases.push(self.application_dir(layer, &id.name).join(kind));
            }
        }
        for layer in Layer::SEARCH_ORDER {
            bases.push(self.root(layer).join("shared").join(kind));
        }

        let mut dirs = Vec::new();
        for base in bases {
            for sub in subdirs {
                dirs.push(base.join(sub));
            }
            dirs.push(base);
        }
        dirs
    }

    pub fn find_template(&self, name: &str, hierarchy: &[ApplicationId]) -> Option<PathBuf> {
        let file = template_file_name(name);
        self.template_dirs(hierarchy)
            .into_iter()
            .map(|dir| dir.join(&file))
            .find(|path| path.is_file())
    }

    pub fn find_script(&self, name: &str, hierarchy: &[ApplicationId], phase: Phase) -> Option<PathBuf> {
        self.script_dirs(hierarchy, phase)
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Path of `addons/<id>.json`, local layer first.
    pub fn addon_path(&self, id: &str) -> Option<PathBuf> {
        if id.contains('/') || id.contains("..") {
            warn!("Rejecting addon id with path components: {}", id);
            return None;
        }
        Layer::SEARCH_ORDER
            .iter()
            .map(|&layer| self.root(layer).join("addons").join(format!("{}.json", id)))
            .find(|path| path.is_file())
    }

    pub fn list_addon_ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for layer in Layer::SEARCH_ORDER {
            let dir = self.root(layer).join("addons");
            if !dir.exists() {
                continue;
            }
            for entry in WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
                    if let Some(stem) = path.file_stem() {
                        ids.insert(stem.to_string_lossy().to_string());
                    }
                }
            }
        }
        ids.into_iter().collect()
    }
}

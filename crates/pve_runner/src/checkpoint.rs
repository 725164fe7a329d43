//! Restart checkpoints.
//!
//! After every successful command the executor writes a [`RestartInfo`]
//! file. Passing it back on the next run skips the commands that already
//! completed and restores the outputs they produced.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{RunnerError, RunnerResult};

/// Progress of one execution, persisted as pretty JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartInfo {
    /// Identifies this execution across restarts.
    pub restart_key: Uuid,
    pub application_id: String,
    pub task: String,
    /// Index of the last command that completed, if any.
    pub last_successful_index: Option<usize>,
    /// Outputs collected so far.
    pub outputs: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl RestartInfo {
    pub fn new(application_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            restart_key: Uuid::new_v4(),
            application_id: application_id.into(),
            task: task.into(),
            last_successful_index: None,
            outputs: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Index of the first command still to run.
    pub fn next_index(&self) -> usize {
        self.last_successful_index.map_or(0, |i| i + 1)
    }

    /// Record that the command at `index` completed with `outputs`.
    pub fn record(&mut self, index: usize, outputs: BTreeMap<String, String>) {
        self.last_successful_index = Some(index);
        self.outputs.extend(outputs);
        self.updated_at = Utc::now();
    }

    /// Save the checkpoint to disk.
    pub fn save(&self, path: &Path) -> RunnerResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        debug!("Saved restart info to {:?}", path);
        Ok(())
    }

    /// Load a checkpoint from disk.
    pub fn load(path: &Path) -> RunnerResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Fail unless this checkpoint was written for `application_id` and `task`.
    pub fn ensure_matches(&self, application_id: &str, task: &str) -> RunnerResult<()> {
        if self.application_id == application_id && self.task == task {
            return Ok(());
        }
        Err(RunnerError::CheckpointMismatch {
            expected: format!("{}/{}", application_id, task),
            found: format!("{}/{}", self.application_id, self.task),
        })
    }

    /// Default checkpoint file for an application and task.
    pub fn default_path(dir: &Path, application_id: &str, task: &str) -> PathBuf {
        dir.join(format!("restart-{}-{}.json", application_id, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let path = RestartInfo::default_path(&temp.path().join("state"), "web", "installation");

        let mut info = RestartInfo::new("web", "installation");
        assert_eq!(info.next_index(), 0);
        info.record(2, BTreeMap::from([("vm_id".to_string(), "105".to_string())]));
        info.save(&path).unwrap();

        let loaded = RestartInfo::load(&path).unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.next_index(), 3);
        assert!(path.ends_with("state/restart-web-installation.json"));
        assert!(loaded.ensure_matches("web", "installation").is_ok());
        assert!(loaded.ensure_matches("web", "backup").is_err());
    }
}

//! Read-through document cache validated by file modification time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};
use crate::source::JsonDocument;

struct CachedDocument {
    modified: Option<SystemTime>,
    document: Arc<JsonDocument>,
}

/// Parsed documents keyed by path.
///
/// An entry is served only while the file's mtime matches the one recorded
/// when it was parsed. Writers that replace files faster than the filesystem's
/// mtime resolution must call [`DocumentCache::invalidate`].
#[derive(Default)]
pub struct DocumentCache {
    entries: RwLock<HashMap<PathBuf, CachedDocument>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`, reusing the cached parse when the file is unchanged.
    pub fn load(&self, path: &Path) -> TemplateResult<Arc<JsonDocument>> {
        let modified = fs::metadata(path)?.modified().ok();

        if let Some(entry) = self.entries.read().get(path) {
            if modified.is_some() && entry.modified == modified {
                return Ok(Arc::clone(&entry.document));
            }
        }

        debug!("Parsing {:?}", path);
        let text = fs::read_to_string(path)?;
        let document = Arc::new(JsonDocument::parse(path, text).map_err(TemplateError::Invalid)?);
        self.entries.write().insert(
            path.to_path_buf(),
            CachedDocument {
                modified,
                document: Arc::clone(&document),
            },
        );
        Ok(document)
    }

    /// Drop the entry for `path`. Returns whether one existed.
    pub fn invalidate(&self, path: &Path) -> bool {
        self.entries.write().remove(path).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::tempdir;

    #[test]
    fn test_reuses_until_mtime_changes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("app.json");
        fs::write(&path, r#"{"name": "first"}"#).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

        let cache = DocumentCache::new();
        let first = cache.load(&path).unwrap();
        let again = cache.load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        fs::write(&path, r#"{"name": "second"}"#).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_100, 0)).unwrap();

        let reloaded = cache.load(&path).unwrap();
        assert_eq!(reloaded.value["name"], "second");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_forces_reparse() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("t.json");
        fs::write(&path, r#"{"name": "a"}"#).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();

        let cache = DocumentCache::new();
        cache.load(&path).unwrap();

        // Same mtime, different content: only an explicit bust sees it.
        fs::write(&path, r#"{"name": "b"}"#).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        assert_eq!(cache.load(&path).unwrap().value["name"], "a");

        assert!(cache.invalidate(&path));
        assert_eq!(cache.load(&path).unwrap().value["name"], "b");
    }

    #[test]
    fn test_parse_error_is_not_cached() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, "{ nope").unwrap();

        let cache = DocumentCache::new();
        assert!(matches!(cache.load(&path), Err(TemplateError::Invalid(_))));
        assert!(cache.is_empty());
    }
}

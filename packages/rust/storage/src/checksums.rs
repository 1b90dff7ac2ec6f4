//! Persisted path → content-hash map used for change detection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use quire_shared::{QuireError, Result, write_json_atomic};

/// Checksums of the sources built by previous cycles.
#[derive(Debug, Clone, Default)]
pub struct ChecksumStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl ChecksumStore {
    /// Load the store. A missing or malformed file yields an empty map,
    /// which forces a full rebuild.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "checksum file unreadable, rebuilding everything");
                    BTreeMap::new()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "no checksum file yet");
                BTreeMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn get(&self, rel: &str) -> Option<&str> {
        self.entries.get(rel).map(String::as_str)
    }

    /// Record a hash. Returns whether the stored value changed.
    pub fn set(&mut self, rel: impl Into<String>, hash: impl Into<String>) -> bool {
        let hash = hash.into();
        let previous = self.entries.insert(rel.into(), hash.clone());
        previous.as_deref() != Some(hash.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Persist the map (pretty JSON, atomic replace).
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(QuireError::validation("checksum store has no backing file"));
        }
        write_json_atomic(&self.path, &self.entries)?;
        debug!(entries = self.entries.len(), "checksums saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("quire-checksums-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_loads_empty() {
        let tmp = temp_dir();
        let store = ChecksumStore::load(&tmp.join("checksums.json"));
        assert!(store.is_empty());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn malformed_file_loads_empty() {
        let tmp = temp_dir();
        let path = tmp.join("checksums.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(ChecksumStore::load(&path).is_empty());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn save_then_load() {
        let tmp = temp_dir();
        let path = tmp.join("_build/checksums.json");

        let mut store = ChecksumStore::load(&path);
        assert!(store.set("index.qmd", "aaa"));
        assert!(!store.set("index.qmd", "aaa"));
        store.set("tasks.qmd", "bbb");
        store.save().unwrap();

        let reloaded = ChecksumStore::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("tasks.qmd"), Some("bbb"));

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

//! Content-addressed store of executed notebook groups.
//!
//! One JSON file per group hash under `_nbcache/`. Files are written with
//! temp + rename, so an artifact is either complete or absent.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use quire_shared::{CURRENT_SCHEMA_VERSION, NotebookArtifact, QuireError, Result, write_json_atomic};

/// Handle to the notebook cache directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NotebookCache {
    dir: PathBuf,
}

impl NotebookCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds the artifact for `hash`.
    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.json"))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.artifact_path(hash).exists()
    }

    /// Load a cached artifact. Unreadable or foreign-schema files count as
    /// a miss so the group simply runs again.
    pub fn load(&self, hash: &str) -> Option<NotebookArtifact> {
        let path = self.artifact_path(hash);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<NotebookArtifact>(&content) {
            Ok(artifact) if artifact.schema_version == CURRENT_SCHEMA_VERSION => Some(artifact),
            Ok(artifact) => {
                warn!(
                    hash,
                    schema_version = artifact.schema_version,
                    "ignoring notebook artifact with unsupported schema"
                );
                None
            }
            Err(e) => {
                warn!(hash, error = %e, "ignoring corrupt notebook artifact");
                None
            }
        }
    }

    /// Persist an artifact under its own hash.
    pub fn store(&self, artifact: &NotebookArtifact) -> Result<PathBuf> {
        if artifact.hash.is_empty() {
            return Err(QuireError::validation("notebook artifact without hash"));
        }
        let path = self.artifact_path(&artifact.hash);
        write_json_atomic(&path, artifact)?;
        debug!(hash = %artifact.hash, cells = artifact.cells.len(), "notebook artifact stored");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_shared::{CellOutput, CellRecord};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("quire-nbcache-test-{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn store_then_load() {
        let tmp = temp_dir();
        let cache = NotebookCache::new(&tmp);
        let artifact = NotebookArtifact::new(
            "h1",
            "tasks.qmd",
            vec![CellRecord {
                code: "print(2+2)\n".into(),
                outputs: vec![CellOutput::stdout("4\n")],
            }],
        );

        assert!(!cache.contains("h1"));
        cache.store(&artifact).unwrap();
        assert!(cache.contains("h1"));

        let loaded = cache.load("h1").unwrap();
        assert_eq!(loaded.cells.len(), 1);
        assert_eq!(loaded.cells[0].outputs, vec![CellOutput::stdout("4\n")]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn corrupt_artifact_is_a_miss() {
        let tmp = temp_dir();
        std::fs::create_dir_all(&tmp).unwrap();
        let cache = NotebookCache::new(&tmp);
        std::fs::write(cache.artifact_path("bad"), "{\"schema_version\":").unwrap();
        assert!(cache.load("bad").is_none());
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn unsupported_schema_is_a_miss() {
        let tmp = temp_dir();
        let cache = NotebookCache::new(&tmp);
        let mut artifact = NotebookArtifact::new("h2", "a.qmd", vec![]);
        artifact.schema_version = 99;
        cache.store(&artifact).unwrap();
        assert!(cache.load("h2").is_none());
        let _ = std::fs::remove_dir_all(&tmp);
    }
}

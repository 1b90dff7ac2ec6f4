//! Filesystem helpers shared by writers of staged, served and cached files.

use std::path::Path;

use crate::error::{QuireError, Result};

/// Write `content` so readers see either the old file or the new one.
///
/// The data goes to a uniquely named sibling temp file first and is then
/// renamed over the target.
pub fn write_atomic(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| QuireError::validation(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| QuireError::io(parent, e))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::now_v7()));

    std::fs::write(&temp, content).map_err(|e| QuireError::io(&temp, e))?;
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(QuireError::io(path, e));
    }
    Ok(())
}

/// Write a value as pretty JSON, atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| QuireError::validation(format!("JSON serialization failed: {e}")))?;
    write_atomic(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = std::env::temp_dir().join(format!("quire-fs-test-{}", uuid::Uuid::now_v7()));
        let target = dir.join("nested/page.html");

        write_atomic(&target, "one").unwrap();
        write_atomic(&target, "two").unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "two");
        for entry in std::fs::read_dir(dir.join("nested")).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.starts_with('.'), "temp file left behind: {name}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}

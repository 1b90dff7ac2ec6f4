//! Project directory layout.
//!
//! Every component receives a [`ProjectLayout`] instead of reading process
//! globals, so several projects can be built side by side in one process.

use std::path::{Component, Path, PathBuf};

use crate::error::{QuireError, Result};

/// Staging tree: staged sources and compiled per-source HTML.
pub const BUILD_DIR: &str = "_build";
/// Served tree: assembled pages.
pub const DISPLAY_DIR: &str = "_display";
/// Templates, Lua filter, MathJax copy.
pub const TEMPLATE_DIR: &str = "_template";
/// Executed notebook artifacts.
pub const CACHE_DIR: &str = "_nbcache";

/// Resolved directories of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub display_dir: PathBuf,
    pub template_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl ProjectLayout {
    /// Build a layout rooted at `root` (canonicalized so that watcher
    /// events and relative keys agree).
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).map_err(|e| QuireError::io(root, e))?;
        Ok(Self {
            build_dir: root.join(BUILD_DIR),
            display_dir: root.join(DISPLAY_DIR),
            template_dir: root.join(TEMPLATE_DIR),
            cache_dir: root.join(CACHE_DIR),
            root,
        })
    }

    /// Create the staging, served and cache trees.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.build_dir, &self.display_dir, &self.cache_dir] {
            std::fs::create_dir_all(dir).map_err(|e| QuireError::io(dir, e))?;
        }
        Ok(())
    }

    /// `_build/checksums.json`
    pub fn checksum_path(&self) -> PathBuf {
        self.build_dir.join("checksums.json")
    }

    /// Absolute source path for a project-relative key.
    pub fn source(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Staged copy of a source (`_build/<rel>`).
    pub fn staged_source(&self, rel: &str) -> PathBuf {
        self.build_dir.join(rel)
    }

    /// Compiled HTML of a staged source (`_build/<rel>.html`, extension swapped).
    pub fn staged_html(&self, rel: &str) -> PathBuf {
        self.build_dir.join(html_name(rel))
    }

    /// Served page of a render root (`_display/<rel>.html`).
    pub fn served_html(&self, rel: &str) -> PathBuf {
        self.display_dir.join(html_name(rel))
    }

    /// Code-block table persisted next to a staged source.
    pub fn cells_table(&self, rel: &str) -> PathBuf {
        self.build_dir.join(format!("{rel}.cells.json"))
    }

    /// Whether `path` lies inside the staging or served tree.
    pub fn is_generated(&self, path: &Path) -> bool {
        path.starts_with(&self.build_dir)
            || path.starts_with(&self.display_dir)
            || path.starts_with(&self.cache_dir)
    }

    /// Project-relative POSIX key for an absolute path inside the project.
    pub fn relative_key(&self, path: &Path) -> Option<String> {
        let normalized = normalize(path);
        let rel = normalized.strip_prefix(&self.root).ok()?;
        Some(to_posix(rel))
    }
}

/// Swap a source key's extension for `.html`.
pub fn html_name(rel: &str) -> String {
    match rel.rfind('.') {
        Some(dot) if !rel[dot..].contains('/') => format!("{}.html", &rel[..dot]),
        _ => format!("{rel}.html"),
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Render a relative path with forward slashes.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Path of `target` relative to directory `from`, POSIX-style.
pub fn relative_from(from: &Path, target: &Path) -> String {
    match pathdiff::diff_paths(target, from) {
        Some(rel) => to_posix(&rel),
        None => target.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_name_swaps_extension() {
        assert_eq!(html_name("index.qmd"), "index.html");
        assert_eq!(html_name("notes/day.1.qmd"), "notes/day.1.html");
        assert_eq!(html_name("a.dir/README"), "a.dir/README.html");
    }

    #[test]
    fn normalize_collapses_parent_dirs() {
        let p = normalize(Path::new("/proj/sub/../shared/./x.qmd"));
        assert_eq!(p, PathBuf::from("/proj/shared/x.qmd"));
    }

    #[test]
    fn relative_from_walks_up() {
        let rel = relative_from(Path::new("/p/_display/notes"), Path::new("/p/_display/mathjax/es5/tex.js"));
        assert_eq!(rel, "../mathjax/es5/tex.js");
    }

    #[test]
    fn relative_key_strips_root() {
        let dir = std::env::temp_dir().join(format!("quire-layout-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("notes")).unwrap();
        let layout = ProjectLayout::new(&dir).unwrap();

        let key = layout.relative_key(&layout.root.join("notes/../notes/a.qmd"));
        assert_eq!(key.as_deref(), Some("notes/a.qmd"));
        assert!(layout.relative_key(Path::new("/elsewhere/a.qmd")).is_none());
        assert!(layout.is_generated(&layout.build_dir.join("a.html")));
        assert_eq!(layout.served_html("notes/a.qmd"), layout.display_dir.join("notes/a.html"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

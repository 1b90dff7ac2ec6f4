//! Include-directive analysis.
//!
//! Walks every render root depth-first, resolving `{{< include >}}` and
//! `{{< embed >}}` directives into a dependency graph keyed by
//! project-relative POSIX paths.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use quire_shared::syntax::INCLUDE_RE;
use quire_shared::{ProjectLayout, QuireError, Result, normalize};

// ---------------------------------------------------------------------------
// IncludeGraph
// ---------------------------------------------------------------------------

/// Resolved include relationships of one project.
#[derive(Debug, Clone, Default)]
pub struct IncludeGraph {
    /// Declared render roots that exist on disk, in configuration order.
    pub render_roots: Vec<String>,
    /// Declared render roots whose source is missing.
    pub missing_roots: Vec<String>,
    /// Path → direct includes, in directive order.
    pub tree: BTreeMap<String, Vec<String>>,
    /// Path → directory of the root document that first reached it.
    pub roots: BTreeMap<String, PathBuf>,
    /// Path → direct includers.
    pub included_by: BTreeMap<String, Vec<String>>,
}

impl IncludeGraph {
    pub fn is_render_root(&self, rel: &str) -> bool {
        self.render_roots.iter().any(|r| r == rel)
    }

    /// Every analyzed path.
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.tree.keys()
    }

    pub fn includes(&self, rel: &str) -> &[String] {
        self.tree.get(rel).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn includers(&self, rel: &str) -> &[String] {
        self.included_by.get(rel).map(Vec::as_slice).unwrap_or_default()
    }

    /// Render roots reachable upward from `paths` through `included_by`,
    /// including the paths themselves when they are roots.
    pub fn affected_roots<'a>(&self, paths: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = paths.into_iter().cloned().collect();

        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if self.is_render_root(&current) {
                result.insert(current.clone());
            }
            stack.extend(self.includers(&current).iter().cloned());
        }
        result
    }

    /// Follow the first includer upward until a render root is reached.
    /// Paths that nothing includes own themselves.
    pub fn owning_root(&self, rel: &str) -> String {
        let mut current = rel.to_string();
        let mut seen = BTreeSet::new();
        while !self.is_render_root(&current) {
            if !seen.insert(current.clone()) {
                break;
            }
            match self.includers(&current).first() {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }
        current
    }

    /// Directory used as the second include search location for `rel`.
    pub fn root_dir(&self, layout: &ProjectLayout, rel: &str) -> PathBuf {
        self.roots.get(rel).cloned().unwrap_or_else(|| {
            layout
                .source(rel)
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| layout.root.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve an include target against the includer's directory, the owning
/// root's directory and that directory's parent. First existing match wins.
pub fn resolve_include(includer: &Path, root_dir: &Path, include: &str) -> Option<PathBuf> {
    let mut candidates = Vec::with_capacity(3);
    if let Some(dir) = includer.parent() {
        candidates.push(dir.join(include));
    }
    candidates.push(root_dir.join(include));
    if let Some(parent) = root_dir.parent() {
        candidates.push(parent.join(include));
    }

    candidates
        .into_iter()
        .map(|c| normalize(&c))
        .find(|c| c.is_file())
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Analyze the include structure below the given render roots.
///
/// Fails on an unresolved include, an include that leaves the project, or
/// a cycle. Missing render roots are skipped with a warning.
#[instrument(skip_all, fields(roots = render.len()))]
pub fn analyze_includes(layout: &ProjectLayout, render: &[String]) -> Result<IncludeGraph> {
    let mut walker = Walker {
        layout,
        graph: IncludeGraph::default(),
        done: BTreeSet::new(),
    };

    for rel in render {
        let abs = layout.source(rel);
        if abs.is_file() {
            walker.graph.render_roots.push(rel.clone());
        } else {
            warn!(root = %rel, "render root not found, skipping");
            walker.graph.missing_roots.push(rel.clone());
        }
    }

    let roots = walker.graph.render_roots.clone();
    for rel in &roots {
        let abs = layout.source(rel);
        let root_dir = abs.parent().map(Path::to_path_buf).unwrap_or_else(|| layout.root.clone());
        walker.graph.roots.entry(rel.clone()).or_insert(root_dir.clone());
        let mut chain = Vec::new();
        walker.visit(rel, &root_dir, &mut chain)?;
    }

    debug!(
        files = walker.graph.tree.len(),
        edges = walker.graph.included_by.values().map(Vec::len).sum::<usize>(),
        "include graph analyzed"
    );
    Ok(walker.graph)
}

struct Walker<'a> {
    layout: &'a ProjectLayout,
    graph: IncludeGraph,
    done: BTreeSet<String>,
}

impl Walker<'_> {
    fn visit(&mut self, rel: &str, root_dir: &Path, chain: &mut Vec<String>) -> Result<()> {
        if let Some(pos) = chain.iter().position(|c| c == rel) {
            let mut cycle: Vec<&str> = chain[pos..].iter().map(String::as_str).collect();
            cycle.push(rel);
            return Err(QuireError::CyclicInclude {
                chain: cycle.join(" -> "),
            });
        }
        if self.done.contains(rel) {
            return Ok(());
        }

        let abs = self.layout.source(rel);
        let text = std::fs::read_to_string(&abs).map_err(|e| QuireError::io(&abs, e))?;

        let mut includes = Vec::new();
        for caps in INCLUDE_RE.captures_iter(&text) {
            let include = &caps[2];
            let target = resolve_include(&abs, root_dir, include).ok_or_else(|| {
                QuireError::UnresolvedInclude {
                    include: include.to_string(),
                    includer: abs.clone(),
                }
            })?;
            let key = self.layout.relative_key(&target).ok_or_else(|| {
                QuireError::validation(format!(
                    "include '{include}' in {rel} resolves outside the project: {}",
                    target.display()
                ))
            })?;
            if !includes.contains(&key) {
                includes.push(key);
            }
        }

        chain.push(rel.to_string());
        for key in &includes {
            let includers = self.graph.included_by.entry(key.clone()).or_default();
            if !includers.iter().any(|i| i == rel) {
                includers.push(rel.to_string());
            }
            self.graph
                .roots
                .entry(key.clone())
                .or_insert_with(|| root_dir.to_path_buf());
            self.visit(key, root_dir, chain)?;
        }
        chain.pop();

        self.graph.tree.insert(rel.to_string(), includes);
        self.done.insert(rel.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(files: &[(&str, &str)]) -> (PathBuf, ProjectLayout) {
        let dir = std::env::temp_dir().join(format!("quire-analyzer-test-{}", uuid::Uuid::now_v7()));
        for (rel, content) in files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        std::fs::create_dir_all(&dir).unwrap();
        let layout = ProjectLayout::new(&dir).unwrap();
        (dir, layout)
    }

    #[test]
    fn nested_includes_build_tree_and_reverse_map() {
        let (dir, layout) = project(&[
            ("a.qmd", "# A\n{{< include b.qmd >}}\n"),
            ("b.qmd", "B\n{{< embed parts/c.qmd >}}\n"),
            ("parts/c.qmd", "C\n"),
            ("other.qmd", "# Other\n"),
        ]);

        let graph = analyze_includes(&layout, &["a.qmd".into(), "other.qmd".into()]).unwrap();
        assert_eq!(graph.includes("a.qmd"), ["b.qmd"]);
        assert_eq!(graph.includes("b.qmd"), ["parts/c.qmd"]);
        assert_eq!(graph.includers("parts/c.qmd"), ["b.qmd"]);
        assert_eq!(graph.roots["parts/c.qmd"], layout.root);
        assert_eq!(graph.owning_root("parts/c.qmd"), "a.qmd");

        let affected = graph.affected_roots(&["parts/c.qmd".to_string()]);
        assert_eq!(affected.into_iter().collect::<Vec<_>>(), vec!["a.qmd"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn include_falls_back_to_root_directory() {
        let (dir, layout) = project(&[
            ("main.qmd", "{{< include sub/one.qmd >}}\n"),
            ("sub/one.qmd", "{{< include shared.qmd >}}\n"),
            ("shared.qmd", "shared\n"),
        ]);

        let graph = analyze_includes(&layout, &["main.qmd".into()]).unwrap();
        assert_eq!(graph.includes("sub/one.qmd"), ["shared.qmd"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unresolved_include_names_text_and_includer() {
        let (dir, layout) = project(&[("index.qmd", "{{< include nowhere.qmd >}}\n")]);

        let err = analyze_includes(&layout, &["index.qmd".into()]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nowhere.qmd"), "{msg}");
        assert!(msg.contains("index.qmd"), "{msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cycle_is_reported_with_chain() {
        let (dir, layout) = project(&[
            ("a.qmd", "{{< include b.qmd >}}\n"),
            ("b.qmd", "{{< include a.qmd >}}\n"),
        ]);

        let err = analyze_includes(&layout, &["a.qmd".into()]).unwrap_err();
        match err {
            QuireError::CyclicInclude { chain } => assert_eq!(chain, "a.qmd -> b.qmd -> a.qmd"),
            other => panic!("expected cycle, got {other}"),
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn shared_fragment_is_not_a_cycle() {
        let (dir, layout) = project(&[
            ("a.qmd", "{{< include b.qmd >}}\n{{< include c.qmd >}}\n"),
            ("b.qmd", "{{< include c.qmd >}}\n"),
            ("c.qmd", "leaf\n"),
        ]);

        let graph = analyze_includes(&layout, &["a.qmd".into()]).unwrap();
        assert_eq!(graph.includers("c.qmd"), ["b.qmd", "a.qmd"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_root_is_skipped() {
        let (dir, layout) = project(&[("index.qmd", "# Index\n")]);

        let graph = analyze_includes(&layout, &["index.qmd".into(), "gone.qmd".into()]).unwrap();
        assert_eq!(graph.render_roots, vec!["index.qmd"]);
        assert_eq!(graph.missing_roots, vec!["gone.qmd"]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Per-file build state and build ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, instrument};

use quire_shared::syntax::CODE_RE;
use quire_shared::{ProjectLayout, SourceKind, content_hash};
use quire_storage::ChecksumStore;

use crate::analyzer::IncludeGraph;

// ---------------------------------------------------------------------------
// RenderNode
// ---------------------------------------------------------------------------

/// Diagnostic tags shown in logs. They never influence what gets built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusTag {
    UnrunNotebook,
    WaitingOnInclude,
    MissingHtml,
}

impl fmt::Display for StatusTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrunNotebook => write!(f, "unrun notebook"),
            Self::WaitingOnInclude => write!(f, "waiting on include build"),
            Self::MissingHtml => write!(f, "missing html"),
        }
    }
}

/// Build state of one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderNode {
    pub path: String,
    pub kind: SourceKind,
    /// Content hash, `None` when the source no longer exists.
    pub hash: Option<String>,
    pub includes: Vec<String>,
    pub included_by: Vec<String>,
    pub has_code: bool,
    pub needs_build: bool,
    pub status: BTreeSet<StatusTag>,
}

impl RenderNode {
    /// A fragment that includes nothing.
    pub fn is_leaf(&self) -> bool {
        self.kind == SourceKind::Fragment && self.includes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RenderRegistry
// ---------------------------------------------------------------------------

/// Typed node table built once per cycle from an [`IncludeGraph`].
#[derive(Debug, Clone)]
pub struct RenderRegistry {
    nodes: BTreeMap<String, RenderNode>,
    render_roots: Vec<String>,
}

impl RenderRegistry {
    /// Classify every analyzed path and hash its current content.
    pub fn new(layout: &ProjectLayout, graph: &IncludeGraph) -> Self {
        let mut nodes = BTreeMap::new();
        for path in graph.paths() {
            let text = std::fs::read_to_string(layout.source(path)).ok();
            let kind = if graph.is_render_root(path) {
                SourceKind::RenderRoot
            } else {
                SourceKind::Fragment
            };
            nodes.insert(
                path.clone(),
                RenderNode {
                    path: path.clone(),
                    kind,
                    hash: text.as_deref().map(content_hash),
                    includes: graph.includes(path).to_vec(),
                    included_by: graph.includers(path).to_vec(),
                    has_code: text.as_deref().is_some_and(|t| CODE_RE.is_match(t)),
                    needs_build: false,
                    status: BTreeSet::new(),
                },
            );
        }

        Self {
            nodes,
            render_roots: graph.render_roots.clone(),
        }
    }

    pub fn node(&self, path: &str) -> Option<&RenderNode> {
        self.nodes.get(path)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RenderNode> {
        self.nodes.values()
    }

    pub fn render_roots(&self) -> &[String] {
        &self.render_roots
    }

    /// Compare each node's hash with the store and flag the differences.
    /// Returns the outdated paths.
    pub fn mark_outdated(&mut self, store: &ChecksumStore) -> Vec<String> {
        let mut outdated = Vec::new();
        for node in self.nodes.values_mut() {
            node.needs_build = match &node.hash {
                Some(hash) => store.get(&node.path) != Some(hash.as_str()),
                None => false,
            };
            if node.needs_build {
                outdated.push(node.path.clone());
            }
        }
        debug!(outdated = outdated.len(), "outdated nodes marked");
        outdated
    }

    /// Flag explicitly changed paths, then propagate one hop up to direct
    /// includers of every flagged node. Returns the sorted staged set.
    #[instrument(skip_all, fields(changed = changed.map_or(0, |c| c.len())))]
    pub fn stage_targets(&mut self, changed: Option<&BTreeSet<String>>) -> Vec<String> {
        if let Some(changed) = changed {
            for path in changed {
                if let Some(node) = self.nodes.get_mut(path) {
                    if node.hash.is_some() {
                        node.needs_build = true;
                    }
                }
            }
        }

        let seeds: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.needs_build)
            .map(|n| n.path.clone())
            .collect();
        for seed in &seeds {
            let parents = self.nodes[seed].included_by.clone();
            for parent in parents {
                if let Some(node) = self.nodes.get_mut(&parent) {
                    if node.hash.is_some() {
                        node.needs_build = true;
                    }
                }
            }
        }

        // BTreeMap iteration is already sorted.
        self.nodes
            .values()
            .filter(|n| n.needs_build)
            .map(|n| n.path.clone())
            .collect()
    }

    /// Post-order over the render roots: includes before includers.
    pub fn render_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        for root in &self.render_roots {
            self.visit(root, &mut visited, &mut order);
        }
        order
    }

    fn visit(&self, path: &str, visited: &mut BTreeSet<String>, order: &mut Vec<String>) {
        if !visited.insert(path.to_string()) {
            return;
        }
        if let Some(node) = self.nodes.get(path) {
            for child in &node.includes {
                self.visit(child, visited, order);
            }
            order.push(path.to_string());
        }
    }

    /// Recompute diagnostic tags from what is on disk. `pending_notebooks`
    /// names sources with notebook groups still running.
    pub fn refresh_status_tags(&mut self, layout: &ProjectLayout, pending_notebooks: &BTreeSet<String>) {
        let missing: BTreeSet<String> = self
            .nodes
            .keys()
            .filter(|p| !layout.staged_html(p).exists())
            .cloned()
            .collect();

        for node in self.nodes.values_mut() {
            node.status.clear();
            if node.has_code && pending_notebooks.contains(&node.path) {
                node.status.insert(StatusTag::UnrunNotebook);
            }
            if node.includes.iter().any(|i| missing.contains(i)) {
                node.status.insert(StatusTag::WaitingOnInclude);
            }
            if missing.contains(&node.path) {
                node.status.insert(StatusTag::MissingHtml);
            }
            if !node.status.is_empty() {
                let tags: Vec<String> = node.status.iter().map(ToString::to_string).collect();
                debug!(path = %node.path, status = %tags.join(", "), "node status");
            }
        }
    }

    /// Record hashes for nodes built this cycle. Returns the number of
    /// entries written.
    pub fn update_checksums(&self, store: &mut ChecksumStore) -> usize {
        let mut written = 0;
        for node in self.nodes.values().filter(|n| n.needs_build) {
            if let Some(hash) = &node.hash {
                store.set(node.path.clone(), hash.clone());
                written += 1;
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_includes;
    use std::path::PathBuf;

    fn project(files: &[(&str, &str)]) -> (PathBuf, ProjectLayout) {
        let dir = std::env::temp_dir().join(format!("quire-registry-test-{}", uuid::Uuid::now_v7()));
        for (rel, content) in files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let layout = ProjectLayout::new(&dir).unwrap();
        (dir, layout)
    }

    fn chain_project() -> (PathBuf, ProjectLayout, IncludeGraph) {
        let (dir, layout) = project(&[
            ("a.qmd", "{{< include b.qmd >}}\n"),
            ("b.qmd", "{{< include c.qmd >}}\n"),
            ("c.qmd", "```{python}\nprint(1)\n```\n"),
            ("z.qmd", "# Z\n"),
        ]);
        let graph = analyze_includes(&layout, &["a.qmd".into(), "z.qmd".into()]).unwrap();
        (dir, layout, graph)
    }

    #[test]
    fn classification_and_order() {
        let (dir, layout, graph) = chain_project();
        let registry = RenderRegistry::new(&layout, &graph);

        assert_eq!(registry.node("a.qmd").unwrap().kind, SourceKind::RenderRoot);
        assert!(registry.node("c.qmd").unwrap().is_leaf());
        assert!(registry.node("c.qmd").unwrap().has_code);
        assert!(!registry.node("b.qmd").unwrap().is_leaf());
        assert_eq!(registry.render_order(), vec!["c.qmd", "b.qmd", "a.qmd", "z.qmd"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn fresh_store_builds_everything() {
        let (dir, layout, graph) = chain_project();
        let mut registry = RenderRegistry::new(&layout, &graph);
        let store = ChecksumStore::load(&layout.checksum_path());

        assert_eq!(registry.mark_outdated(&store).len(), 4);
        assert_eq!(registry.stage_targets(None), vec!["a.qmd", "b.qmd", "c.qmd", "z.qmd"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_change_propagates_one_hop() {
        let (dir, layout, graph) = chain_project();
        let mut store = ChecksumStore::load(&layout.checksum_path());
        let mut registry = RenderRegistry::new(&layout, &graph);
        registry.mark_outdated(&store);
        registry.stage_targets(None);
        assert_eq!(registry.update_checksums(&mut store), 4);

        let mut registry = RenderRegistry::new(&layout, &graph);
        assert!(registry.mark_outdated(&store).is_empty());
        let changed = BTreeSet::from(["c.qmd".to_string()]);
        assert_eq!(registry.stage_targets(Some(&changed)), vec!["b.qmd", "c.qmd"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn hash_detected_change_also_propagates() {
        let (dir, layout, graph) = chain_project();
        let mut store = ChecksumStore::load(&layout.checksum_path());
        let mut registry = RenderRegistry::new(&layout, &graph);
        registry.mark_outdated(&store);
        registry.stage_targets(None);
        registry.update_checksums(&mut store);

        std::fs::write(dir.join("c.qmd"), "changed\n").unwrap();
        let mut registry = RenderRegistry::new(&layout, &graph);
        assert_eq!(registry.mark_outdated(&store), vec!["c.qmd"]);
        assert_eq!(registry.stage_targets(None), vec!["b.qmd", "c.qmd"]);
        assert_eq!(registry.update_checksums(&mut store), 2);
        assert_ne!(store.get("c.qmd"), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn vanished_source_is_not_built() {
        let (dir, layout, graph) = chain_project();
        std::fs::remove_file(dir.join("z.qmd")).unwrap();
        let mut registry = RenderRegistry::new(&layout, &graph);
        let store = ChecksumStore::load(&layout.checksum_path());

        registry.mark_outdated(&store);
        let changed = BTreeSet::from(["z.qmd".to_string()]);
        let staged = registry.stage_targets(Some(&changed));
        assert!(!staged.contains(&"z.qmd".to_string()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn status_tags_follow_disk_state() {
        let (dir, layout, graph) = chain_project();
        let mut registry = RenderRegistry::new(&layout, &graph);
        std::fs::create_dir_all(&layout.build_dir).unwrap();
        std::fs::write(layout.staged_html("b.qmd"), "<p>b</p>").unwrap();

        let pending = BTreeSet::from(["c.qmd".to_string()]);
        registry.refresh_status_tags(&layout, &pending);

        let b = registry.node("b.qmd").unwrap();
        assert!(b.status.contains(&StatusTag::WaitingOnInclude));
        assert!(!b.status.contains(&StatusTag::MissingHtml));
        let c = registry.node("c.qmd").unwrap();
        assert!(c.status.contains(&StatusTag::UnrunNotebook));
        assert!(c.status.contains(&StatusTag::MissingHtml));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

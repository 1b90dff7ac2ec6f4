//! Cross-reference anchors (`{#sec:id}`) and `@sec:id` rewriting.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use quire_shared::syntax::{ANCHOR_RE, HEADING_ANCHOR_RE, REF_RE};
use quire_shared::{ProjectLayout, relative_from};

use crate::analyzer::IncludeGraph;

/// Where an anchor lives once rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// Render root whose page carries the anchor.
    pub owner: String,
    /// Link text: the heading text for heading anchors, else the id.
    pub label: String,
}

/// `sec:id` → anchor.
pub type AnchorIndex = BTreeMap<String, Anchor>;

/// Scan every `.qmd` in the project (generated trees and dot-dirs
/// excluded) for anchor definitions.
#[instrument(skip_all)]
pub fn collect_anchors(layout: &ProjectLayout, graph: &IncludeGraph) -> AnchorIndex {
    let mut anchors = AnchorIndex::new();

    let walker = WalkDir::new(&layout.root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_name().to_string_lossy().starts_with('.') || layout.is_generated(e.path()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "qmd") {
            continue;
        }
        let Some(rel) = layout.relative_key(path) else {
            continue;
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            warn!(path = %rel, "unreadable source skipped during anchor scan");
            continue;
        };

        let owner = graph.owning_root(&rel);
        for line in text.lines() {
            let heading = HEADING_ANCHOR_RE
                .captures(line)
                .map(|c| c[2].trim().to_string());
            for caps in ANCHOR_RE.captures_iter(line) {
                let key = format!("{}:{}", &caps[1], &caps[2]);
                let label = heading.clone().unwrap_or_else(|| caps[2].to_string());
                anchors.insert(
                    key,
                    Anchor {
                        owner: owner.clone(),
                        label,
                    },
                );
            }
        }
    }

    debug!(anchors = anchors.len(), "anchors collected");
    anchors
}

/// Rewrite `@sec:id` references into Markdown links to the owning page,
/// relative to `dest_dir` (the staged file's directory). Unknown ids are
/// left untouched.
pub fn rewrite_refs(text: &str, anchors: &AnchorIndex, layout: &ProjectLayout, dest_dir: &Path) -> String {
    REF_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let key = format!("{}:{}", &caps[1], &caps[2]);
            match anchors.get(&key) {
                Some(anchor) => {
                    let target = relative_from(dest_dir, &layout.staged_html(&anchor.owner));
                    format!("[{}]({target}#{key})", anchor.label)
                }
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_includes;
    use std::path::PathBuf;

    fn project(files: &[(&str, &str)]) -> (PathBuf, ProjectLayout) {
        let dir = std::env::temp_dir().join(format!("quire-anchors-test-{}", uuid::Uuid::now_v7()));
        for (rel, content) in files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let layout = ProjectLayout::new(&dir).unwrap();
        (dir, layout)
    }

    #[test]
    fn heading_anchor_uses_heading_text_and_owner() {
        let (dir, layout) = project(&[
            ("index.qmd", "# Intro\n{{< include parts/methods.qmd >}}\n"),
            ("parts/methods.qmd", "## Methods used {#sec:methods}\n\n![x](a.png){#fig:plot}\n"),
            ("_build/stale.qmd", "# Old {#sec:stale}\n"),
        ]);
        let graph = analyze_includes(&layout, &["index.qmd".into()]).unwrap();

        let anchors = collect_anchors(&layout, &graph);
        assert_eq!(
            anchors["sec:methods"],
            Anchor {
                owner: "index.qmd".into(),
                label: "Methods used".into()
            }
        );
        assert_eq!(anchors["fig:plot"].label, "plot");
        assert!(!anchors.contains_key("sec:stale"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn refs_become_relative_links() {
        let (dir, layout) = project(&[("index.qmd", "# Intro\n")]);
        let mut anchors = AnchorIndex::new();
        anchors.insert(
            "sec:methods".into(),
            Anchor {
                owner: "index.qmd".into(),
                label: "Methods".into(),
            },
        );

        let out = rewrite_refs(
            "See @sec:methods and @sec:unknown.",
            &anchors,
            &layout,
            &layout.build_dir.join("notes"),
        );
        assert_eq!(out, "See [Methods](../index.html#sec:methods) and @sec:unknown.");

        let _ = std::fs::remove_dir_all(&dir);
    }
}

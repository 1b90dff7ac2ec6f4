//! Stage mirror.
//!
//! Copies each outdated source into `_build/`, rewriting it on the way so
//! the compiler only sees plain Markdown:
//! - `@sec:id` references become links to the owning page
//! - include directives become inert `data-include` / `data-embed` divs
//! - Python fences become `data-script` divs, collected into a code table
//! - local images are copied next to the staged file

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, instrument, warn};
use url::Url;

use quire_graph::{AnchorIndex, IncludeGraph, resolve_include, rewrite_refs};
use quire_shared::syntax::{CODE_RE, IMAGE_RE, INCLUDE_RE, include_placeholder, script_placeholder};
use quire_shared::{
    CodeBlock, ProjectLayout, QuireError, Result, html_name, relative_from, write_atomic,
    write_json_atomic,
};

/// Code blocks discovered while staging, keyed by source path.
pub type CodeTables = BTreeMap<String, Vec<CodeBlock>>;

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Stage every path in `staged`. Returns the code tables of sources that
/// contain Python cells.
#[instrument(skip_all, fields(files = staged.len()))]
pub fn stage_sources(
    layout: &ProjectLayout,
    graph: &IncludeGraph,
    anchors: &AnchorIndex,
    staged: &[String],
) -> Result<CodeTables> {
    let mut tables = CodeTables::new();
    for rel in staged {
        let blocks = stage_source(layout, graph, anchors, rel)?;
        if !blocks.is_empty() {
            tables.insert(rel.clone(), blocks);
        }
    }
    info!(
        files = staged.len(),
        with_code = tables.len(),
        "sources staged"
    );
    Ok(tables)
}

/// Stage one source and persist its code table.
pub fn stage_source(
    layout: &ProjectLayout,
    graph: &IncludeGraph,
    anchors: &AnchorIndex,
    rel: &str,
) -> Result<Vec<CodeBlock>> {
    let src = layout.source(rel);
    let dest = layout.staged_source(rel);
    let dest_dir = dest.parent().unwrap_or(layout.build_dir.as_path()).to_path_buf();
    let root_dir = graph.root_dir(layout, rel);

    let text = std::fs::read_to_string(&src).map_err(|e| QuireError::io(&src, e))?;
    let text = rewrite_refs(&text, anchors, layout, &dest_dir);
    let text = replace_includes(layout, &src, &root_dir, &dest_dir, &text)?;
    let (text, blocks) = replace_code(rel, &text);

    copy_images(layout, &src, &root_dir, &text);
    write_atomic(&dest, &text)?;

    let table = layout.cells_table(rel);
    if blocks.is_empty() {
        if table.exists() {
            std::fs::remove_file(&table).map_err(|e| QuireError::io(&table, e))?;
        }
    } else {
        write_json_atomic(&table, &blocks)?;
    }

    debug!(source = %rel, code_blocks = blocks.len(), "staged");
    Ok(blocks)
}

/// Load the code table persisted next to a staged source.
pub fn load_code_table(layout: &ProjectLayout, rel: &str) -> Option<Vec<CodeBlock>> {
    let path = layout.cells_table(rel);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(blocks) => Some(blocks),
        Err(e) => {
            warn!(source = %rel, error = %e, "unreadable code table");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Rewrites
// ---------------------------------------------------------------------------

fn replace_includes(
    layout: &ProjectLayout,
    src: &Path,
    root_dir: &Path,
    dest_dir: &Path,
    text: &str,
) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in INCLUDE_RE.captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let kind = &caps[1];
        let include = &caps[2];

        let target = resolve_include(src, root_dir, include).ok_or_else(|| {
            QuireError::UnresolvedInclude {
                include: include.to_string(),
                includer: src.to_path_buf(),
            }
        })?;
        let target_rel = layout.relative_key(&target).ok_or_else(|| {
            QuireError::validation(format!("include '{include}' resolves outside the project"))
        })?;

        let staged_html = layout.staged_html(&target_rel);
        let relative = relative_from(dest_dir, &staged_html);
        out.push_str(&text[last..whole.start]);
        out.push_str(&include_placeholder(kind, &relative, &html_name(&target_rel)));
        last = whole.end;
    }

    out.push_str(&text[last..]);
    Ok(out)
}

fn replace_code(rel: &str, text: &str) -> (String, Vec<CodeBlock>) {
    let mut blocks = Vec::new();
    let replaced = CODE_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let block = CodeBlock::new(rel, blocks.len() + 1, &caps[1]);
        let placeholder = script_placeholder(rel, block.index, &block.hash);
        blocks.push(block);
        placeholder
    });
    (replaced.into_owned(), blocks)
}

fn copy_images(layout: &ProjectLayout, src: &Path, root_dir: &Path, text: &str) {
    for caps in IMAGE_RE.captures_iter(text) {
        let Some(target) = caps[1].split_whitespace().next() else {
            continue;
        };
        let target = target.trim_matches(|c| c == '<' || c == '>');
        if Url::parse(target).is_ok() {
            continue;
        }

        let Some(found) = resolve_include(src, root_dir, target) else {
            warn!(image = %target, source = %src.display(), "image not found, not copied");
            continue;
        };
        let Some(rel) = layout.relative_key(&found) else {
            debug!(image = %found.display(), "image outside project, not copied");
            continue;
        };

        let dest = layout.build_dir.join(&rel);
        if let Some(parent) = dest.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(image = %rel, error = %e, "cannot create image directory");
                continue;
            }
        }
        if let Err(e) = std::fs::copy(&found, &dest) {
            warn!(image = %rel, error = %e, "image copy failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_graph::{analyze_includes, collect_anchors};
    use quire_shared::syntax::{INCLUDE_PLACEHOLDER_RE, SCRIPT_PLACEHOLDER_RE, attr_value};
    use std::path::PathBuf;

    fn project(files: &[(&str, &str)]) -> (PathBuf, ProjectLayout) {
        let dir = std::env::temp_dir().join(format!("quire-stage-test-{}", uuid::Uuid::now_v7()));
        for (rel, content) in files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let layout = ProjectLayout::new(&dir).unwrap();
        layout.ensure_dirs().unwrap();
        (dir, layout)
    }

    #[test]
    fn includes_and_code_become_placeholders() {
        let (dir, layout) = project(&[
            ("notes/index.qmd", "# Index\n{{< include ../tasks.qmd >}}\n"),
            ("tasks.qmd", "# Tasks\n```{python}\nprint(2+2)\n```\n\n```{python}\n%reset -f\nx = 1\n```\n"),
        ]);
        let graph = analyze_includes(&layout, &["notes/index.qmd".into()]).unwrap();
        let anchors = collect_anchors(&layout, &graph);

        let tables = stage_sources(
            &layout,
            &graph,
            &anchors,
            &["notes/index.qmd".to_string(), "tasks.qmd".to_string()],
        )
        .unwrap();

        let index = std::fs::read_to_string(layout.staged_source("notes/index.qmd")).unwrap();
        let caps = INCLUDE_PLACEHOLDER_RE.captures(&index).unwrap();
        assert_eq!(attr_value(&caps[1], "data-include"), Some("../tasks.html"));
        assert_eq!(attr_value(&caps[1], "data-source"), Some("tasks.html"));
        assert!(!index.contains("{{<"));

        let tasks = std::fs::read_to_string(layout.staged_source("tasks.qmd")).unwrap();
        assert_eq!(SCRIPT_PLACEHOLDER_RE.find_iter(&tasks).count(), 2);
        assert!(!tasks.contains("```"));

        let blocks = &tables["tasks.qmd"];
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].index, 1);
        assert_eq!(blocks[0].code, "print(2+2)\n");
        assert_eq!(load_code_table(&layout, "tasks.qmd").unwrap(), *blocks);
        assert!(!tables.contains_key("notes/index.qmd"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn refs_rewritten_before_staging() {
        let (dir, layout) = project(&[
            ("index.qmd", "# Results {#sec:results}\n\nSee @sec:results.\n"),
        ]);
        let graph = analyze_includes(&layout, &["index.qmd".into()]).unwrap();
        let anchors = collect_anchors(&layout, &graph);

        stage_source(&layout, &graph, &anchors, "index.qmd").unwrap();
        let staged = std::fs::read_to_string(layout.staged_source("index.qmd")).unwrap();
        assert!(staged.contains("[Results](index.html#sec:results)"), "{staged}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn local_images_copied_remote_skipped() {
        let (dir, layout) = project(&[
            ("index.qmd", "![a](img/plot.png)\n![b](https://example.com/x.png)\n![c](missing.png)\n"),
            ("img/plot.png", "png"),
        ]);
        let graph = analyze_includes(&layout, &["index.qmd".into()]).unwrap();

        stage_source(&layout, &graph, &AnchorIndex::new(), "index.qmd").unwrap();
        assert!(layout.build_dir.join("img/plot.png").exists());
        assert!(!layout.build_dir.join("missing.png").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_code_table_removed_when_cells_disappear() {
        let (dir, layout) = project(&[("index.qmd", "```{python}\nx = 1\n```\n")]);
        let graph = analyze_includes(&layout, &["index.qmd".into()]).unwrap();
        let anchors = AnchorIndex::new();

        stage_source(&layout, &graph, &anchors, "index.qmd").unwrap();
        assert!(layout.cells_table("index.qmd").exists());

        std::fs::write(dir.join("index.qmd"), "no code\n").unwrap();
        let blocks = stage_source(&layout, &graph, &anchors, "index.qmd").unwrap();
        assert!(blocks.is_empty());
        assert!(!layout.cells_table("index.qmd").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Template assets, staging-tree preparation and `quire init`.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use quire_render::{BODY_TEMPLATE, LUA_FILTER, PAGE_TEMPLATE};
use quire_shared::{MathMode, PROJECT_FILE_NAME, ProjectLayout, QuireError, Result, write_atomic};

const BODY_TEMPLATE_TEXT: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  $for(header-includes)$
  $header-includes$
  $endfor$
</head>
<body>
$body$
</body>
</html>
"#;

const PAGE_TEMPLATE_TEXT: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>$if(title)$$title$$else$$pagetitle$$endif$</title>
  $for(css)$
  <link rel="stylesheet" href="$css$">
  $endfor$
  $if(math)$
  $math$
  $endif$
  $for(header-includes)$
  $header-includes$
  $endfor$
</head>
<body>
$if(title)$
<h1 class="title">$title$</h1>
$endif$
$body$
</body>
</html>
"#;

const LUA_FILTER_TEXT: &str = "-- placeholder filter\n";

const MATHJAX_DIR: &str = "mathjax";

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Write the built-in templates into `_template/`. Existing files are kept
/// unless `overwrite` is set. Returns the files written.
pub fn ensure_template_assets(layout: &ProjectLayout, overwrite: bool) -> Result<Vec<PathBuf>> {
    let dir = &layout.template_dir;
    std::fs::create_dir_all(dir).map_err(|e| QuireError::io(dir, e))?;

    let mut written = Vec::new();
    for (name, content) in [
        (BODY_TEMPLATE, BODY_TEMPLATE_TEXT),
        (PAGE_TEMPLATE, PAGE_TEMPLATE_TEXT),
        (LUA_FILTER, LUA_FILTER_TEXT),
    ] {
        let path = dir.join(name);
        if overwrite || !path.exists() {
            write_atomic(&path, content)?;
            debug!(path = %path.display(), "template written");
            written.push(path);
        }
    }
    Ok(written)
}

/// Get the staging and served trees ready for a cycle: templates, the Lua
/// filter, a copy of the project file that renders nothing by itself, and
/// the MathJax runtime when math is served locally.
#[instrument(skip_all)]
pub fn prepare_build_tree(layout: &ProjectLayout, math: MathMode) -> Result<()> {
    layout.ensure_dirs()?;
    ensure_template_assets(layout, false)?;

    let filter_src = layout.template_dir.join(LUA_FILTER);
    let filter_dest = layout.build_dir.join(LUA_FILTER);
    std::fs::copy(&filter_src, &filter_dest).map_err(|e| QuireError::io(&filter_src, e))?;

    copy_project_file(layout)?;

    if math == MathMode::MathJax {
        mirror_mathjax(layout)?;
    }
    Ok(())
}

/// Copy `_quarto.yml` into the staging tree with `project.render` emptied,
/// so running the compiler toolchain inside `_build` never re-renders the
/// whole project.
fn copy_project_file(layout: &ProjectLayout) -> Result<()> {
    let src = layout.root.join(PROJECT_FILE_NAME);
    let Ok(content) = std::fs::read_to_string(&src) else {
        return Ok(());
    };
    let mut value: serde_yaml::Value = serde_yaml::from_str(&content)
        .map_err(|e| QuireError::parse(format!("{PROJECT_FILE_NAME}: {e}")))?;

    if let Some(project) = value.get_mut("project").and_then(|p| p.as_mapping_mut()) {
        project.insert("render".into(), serde_yaml::Value::Sequence(Vec::new()));
    }
    let out = serde_yaml::to_string(&value)
        .map_err(|e| QuireError::parse(format!("{PROJECT_FILE_NAME}: {e}")))?;
    write_atomic(&layout.build_dir.join(PROJECT_FILE_NAME), out)
}

/// Mirror `_template/mathjax` into `_display/mathjax`, copying files that
/// are missing or older in the served tree.
fn mirror_mathjax(layout: &ProjectLayout) -> Result<()> {
    let src_root = layout.template_dir.join(MATHJAX_DIR);
    if !src_root.is_dir() {
        warn!(
            path = %src_root.display(),
            "MathJax copy missing; math will not render offline (use --webtex or add the runtime)"
        );
        return Ok(());
    }
    let dest_root = layout.display_dir.join(MATHJAX_DIR);

    let mut copied = 0usize;
    for entry in WalkDir::new(&src_root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&src_root) else {
            continue;
        };
        let dest = dest_root.join(rel);
        if !is_stale(entry.path(), &dest) {
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QuireError::io(parent, e))?;
        }
        std::fs::copy(entry.path(), &dest).map_err(|e| QuireError::io(entry.path(), e))?;
        copied += 1;
    }
    if copied > 0 {
        info!(files = copied, "MathJax mirrored into the served tree");
    }
    Ok(())
}

fn is_stale(src: &Path, dest: &Path) -> bool {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(src), modified(dest)) {
        (Some(s), Some(d)) => s > d,
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

const SAMPLE_PROJECT: &str = "project:\n  render:\n    - index.qmd\n";

const SAMPLE_INDEX: &str = r#"---
title: Sample notebook
---

# Overview {#sec:overview}

This page pulls in the task list from another file; see @sec:tasks.

{{< include tasks.qmd >}}
"#;

const SAMPLE_TASKS: &str = r#"## Tasks {#sec:tasks}

- write the report
- check the numbers below

```{python}
print(2+2)
```
"#;

/// Files touched by [`init_project`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub root: PathBuf,
    pub written: Vec<PathBuf>,
    /// Existing files left untouched.
    pub kept: Vec<PathBuf>,
}

/// Write a runnable sample project into `path`.
#[instrument(skip_all, fields(path = %path.display(), force))]
pub fn init_project(path: &Path, force: bool) -> Result<InitReport> {
    std::fs::create_dir_all(path).map_err(|e| QuireError::io(path, e))?;
    let layout = ProjectLayout::new(path)?;
    let mut report = InitReport {
        root: layout.root.clone(),
        ..Default::default()
    };

    for (name, content) in [
        (PROJECT_FILE_NAME, SAMPLE_PROJECT),
        ("index.qmd", SAMPLE_INDEX),
        ("tasks.qmd", SAMPLE_TASKS),
    ] {
        let file = layout.root.join(name);
        if force || !file.exists() {
            write_atomic(&file, content)?;
            report.written.push(file);
        } else {
            report.kept.push(file);
        }
    }
    report.written.extend(ensure_template_assets(&layout, force)?);

    info!(
        root = %report.root.display(),
        written = report.written.len(),
        kept = report.kept.len(),
        "project initialized"
    );
    Ok(report)
}

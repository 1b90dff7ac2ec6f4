//! Project configuration read from `_quarto.yml`.
//!
//! Only the keys the build pipeline needs are interpreted: the ordered
//! `project.render` list and the bibliography/CSL settings, which may sit at
//! the top level or under any `format.<name>` section.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{QuireError, Result};
use crate::layout::ProjectLayout;

/// Name of the project configuration file.
pub const PROJECT_FILE_NAME: &str = "_quarto.yml";

// ---------------------------------------------------------------------------
// Raw YAML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawProjectFile {
    #[serde(default)]
    project: RawProjectSection,
    #[serde(default)]
    bibliography: Option<OneOrMany>,
    #[serde(default)]
    csl: Option<String>,
    #[serde(default)]
    format: Option<serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProjectSection {
    #[serde(default)]
    render: Vec<String>,
}

/// YAML lets `bibliography` be a single path or a list of paths.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Validated project configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Render roots, project-relative, in declared order.
    pub render: Vec<String>,
    /// Absolute bibliography path, if configured.
    pub bibliography: Option<PathBuf>,
    /// Absolute citation style path, if configured.
    pub csl: Option<PathBuf>,
}

/// Load and validate `_quarto.yml` for a project.
pub fn load_project(layout: &ProjectLayout) -> Result<ProjectConfig> {
    let path = layout.root.join(PROJECT_FILE_NAME);
    let content = std::fs::read_to_string(&path).map_err(|e| QuireError::io(&path, e))?;
    parse_project(&content, &layout.root)
}

/// Parse project YAML and resolve referenced files against `root`.
pub fn parse_project(content: &str, root: &Path) -> Result<ProjectConfig> {
    let raw: RawProjectFile = serde_yaml::from_str(content)
        .map_err(|e| QuireError::config(format!("failed to parse {PROJECT_FILE_NAME}: {e}")))?;

    let render: Vec<String> = raw
        .project
        .render
        .iter()
        .map(|r| r.trim_start_matches("./").to_string())
        .filter(|r| !r.is_empty())
        .collect();

    if render.is_empty() {
        return Err(QuireError::config(format!(
            "{PROJECT_FILE_NAME} lists no documents under project.render"
        )));
    }

    let mut bib_candidates: Vec<String> = raw.bibliography.map(OneOrMany::into_vec).unwrap_or_default();
    let mut csl_candidates: Vec<String> = raw.csl.into_iter().collect();

    if let Some(serde_yaml::Value::Mapping(formats)) = &raw.format {
        for (_name, section) in formats {
            let serde_yaml::Value::Mapping(section) = section else {
                continue;
            };
            match section.get("bibliography") {
                Some(serde_yaml::Value::String(s)) => bib_candidates.push(s.clone()),
                Some(serde_yaml::Value::Sequence(items)) => bib_candidates.extend(
                    items.iter().filter_map(|v| v.as_str().map(String::from)),
                ),
                _ => {}
            }
            if let Some(serde_yaml::Value::String(s)) = section.get("csl") {
                csl_candidates.push(s.clone());
            }
        }
    }

    let bibliography = single_candidate("bibliography", bib_candidates)?
        .map(|b| resolve_existing("bibliography", &b, root))
        .transpose()?;
    let csl = single_candidate("csl", csl_candidates)?
        .map(|c| resolve_existing("CSL", &c, root))
        .transpose()?;

    debug!(roots = render.len(), ?bibliography, ?csl, "project configuration loaded");

    Ok(ProjectConfig {
        render,
        bibliography,
        csl,
    })
}

/// Collapse duplicate mentions; more than one distinct value is ambiguous.
fn single_candidate(key: &str, mut candidates: Vec<String>) -> Result<Option<String>> {
    let mut seen = Vec::new();
    candidates.retain(|c| {
        if seen.contains(c) {
            false
        } else {
            seen.push(c.clone());
            true
        }
    });
    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        _ => Err(QuireError::ambiguous(format!(
            "multiple {key} files found: {}",
            candidates.join(", ")
        ))),
    }
}

/// Expand `~`, anchor relative paths at the project root, require existence.
fn resolve_existing(label: &str, value: &str, root: &Path) -> Result<PathBuf> {
    let expanded = expand_home(value);
    let path = if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    };
    if !path.exists() {
        return Err(QuireError::config(format!("{label} file {value} not found")));
    }
    Ok(path)
}

fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

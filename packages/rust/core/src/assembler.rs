//! Page assembler.
//!
//! Turns a render root's compiled HTML into the served page:
//! 1. Splice included fragments in place of their placeholders, repeatedly,
//!    until none remain (bounded by `max_include_depth`)
//! 2. Replace code placeholders with highlighted source and cached outputs
//! 3. Point the MathJax script at the served tree
//! 4. Add the live-reload beacon (watch mode)
//! 5. Apply the navigation panel, last
//!
//! Anything not available yet becomes a flagged notice, never an error, so
//! a page is always viewable mid-build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use quire_notebook::{NotebookGroup, cell_html, ensure_stylesheet, locate, segment};
use quire_render::MATHJAX_SCRIPT;
use quire_shared::syntax::{
    INCLUDE_PLACEHOLDER_RE, PENDING_CLASS, SCRIPT_PLACEHOLDER_RE, attr_value, escape_attr, escape_html,
    pending_notice,
};
use quire_shared::{
    MathMode, NotebookArtifact, ProjectLayout, QuireError, Result, normalize, relative_from, write_atomic,
};
use quire_stage::load_code_table;
use quire_storage::NotebookCache;

use crate::nav::{NavPage, apply_navigation};

/// Id of the injected live-reload script.
pub const LIVE_RELOAD_ID: &str = "quire-live-reload";

/// Path polled by the live-reload script.
pub const GENERATION_PATH: &str = "/__quire/generation";

static BODY_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<body\b[^>]*>").expect("body regex"));

static MATHJAX_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<script\b[^>]*\bsrc="[^"]*tex-mml-chtml\.js[^"]*"[^>]*>"#).expect("mathjax script regex")
});

static MATH_NODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="math (?:inline|display)""#).expect("math node regex"));

static LIVE_RELOAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<script id="quire-live-reload">.*?</script>\n?"#).expect("live reload regex")
});

/// Settings shared by every page assembled in one pass.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyContext<'a> {
    pub layout: &'a ProjectLayout,
    pub cache: &'a NotebookCache,
    /// Navigation entries, in configuration order.
    pub pages: &'a [NavPage],
    pub math: MathMode,
    pub max_include_depth: usize,
    /// Add the live-reload beacon.
    pub live_reload: bool,
}

/// Result of assembling one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPage {
    pub rel: String,
    pub path: PathBuf,
    /// Flagged notices still on the page.
    pub pending: usize,
}

impl AssembledPage {
    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// Assemble and atomically write the served page of render root `rel`.
#[instrument(skip_all, fields(doc = %rel))]
pub fn assemble_page(ctx: &AssemblyContext<'_>, rel: &str) -> Result<AssembledPage> {
    let layout = ctx.layout;
    let source = layout.source(rel);
    let staged = layout.staged_html(rel);

    let html = if !source.is_file() {
        warn!(doc = %rel, "render root source is missing");
        notice_page(rel, &format!("Missing source file {rel}"))
    } else if !staged.is_file() {
        info!("Waiting for pandoc on {rel} to complete...");
        notice_page(rel, &format!("Waiting for pandoc on {rel} to complete..."))
    } else {
        let compiled = std::fs::read_to_string(&staged).map_err(|e| QuireError::io(&staged, e))?;
        let html = resolve_includes(&compiled, layout, rel, ctx.max_include_depth)?;
        let html = substitute_code(&html, layout, ctx.cache);
        match ctx.math {
            MathMode::MathJax => fix_math_script(&html, layout, rel),
            MathMode::WebTex => html,
        }
    };

    let html = if ctx.live_reload {
        inject_live_reload(&html)
    } else {
        html
    };
    let html = apply_navigation(&html, layout, rel, ctx.pages);
    let pending = html.matches(&format!(r#"class="{PENDING_CLASS}""#)).count();

    let path = layout.served_html(rel);
    write_atomic(&path, &html)?;
    debug!(doc = %rel, pending, "page written");

    Ok(AssembledPage {
        rel: rel.to_string(),
        path,
        pending,
    })
}

fn notice_page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(title),
        pending_notice(message)
    )
}

// ---------------------------------------------------------------------------
// Includes
// ---------------------------------------------------------------------------

/// Replace include placeholders with the bodies of their compiled targets
/// until none remain. A target not compiled yet leaves a waiting notice.
pub fn resolve_includes(html: &str, layout: &ProjectLayout, page: &str, max_depth: usize) -> Result<String> {
    let mut html = html.to_string();

    for round in 0..=max_depth {
        if !INCLUDE_PLACEHOLDER_RE.is_match(&html) {
            return Ok(html);
        }
        if round == max_depth {
            break;
        }

        let mut out = String::with_capacity(html.len());
        let mut last = 0;
        for caps in INCLUDE_PLACEHOLDER_RE.captures_iter(&html) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&html[last..whole.start()]);
            out.push_str(&include_replacement(layout, page, &caps[1])?);
            last = whole.end();
        }
        out.push_str(&html[last..]);
        html = out;
    }

    Err(QuireError::CyclicInclude {
        chain: format!("{page} still has unresolved includes after {max_depth} nested rounds"),
    })
}

fn include_replacement(layout: &ProjectLayout, page: &str, attrs: &str) -> Result<String> {
    let Some(source) = attr_value(attrs, "data-source") else {
        return Err(QuireError::parse(format!(
            "include placeholder without data-source in {page}"
        )));
    };
    let target = normalize(&layout.build_dir.join(source));
    if !target.starts_with(&layout.build_dir) {
        return Err(QuireError::validation(format!(
            "include {source} in {page} points outside the staging tree"
        )));
    }

    match std::fs::read_to_string(&target) {
        Ok(content) => {
            info!("including {source} into {page}");
            Ok(format!(
                "<!-- BEGIN include {source} -->\n{}\n<!-- END include {source} -->",
                body_of(&content)
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(doc = %page, include = %source, "include not compiled yet");
            Ok(pending_notice(&format!("Waiting for pandoc on {source} to complete...")))
        }
        Err(e) => Err(QuireError::io(&target, e)),
    }
}

/// Contents of the document's `<body>`, or the whole text for a bare snippet.
fn body_of(html: &str) -> &str {
    let Some(open) = BODY_OPEN_RE.find(html) else {
        return html.trim();
    };
    let rest = &html[open.end()..];
    match rest.rfind("</body>") {
        Some(close) => rest[..close].trim(),
        None => rest.trim(),
    }
}

// ---------------------------------------------------------------------------
// Code cells
// ---------------------------------------------------------------------------

/// Replace code placeholders with highlighted source and, when the group
/// has been executed, its outputs.
pub fn substitute_code(html: &str, layout: &ProjectLayout, cache: &NotebookCache) -> String {
    if !SCRIPT_PLACEHOLDER_RE.is_match(html) {
        return html.to_string();
    }

    let mut groups: HashMap<String, Option<Vec<NotebookGroup>>> = HashMap::new();
    let mut artifacts: HashMap<String, Option<NotebookArtifact>> = HashMap::new();

    let replaced = SCRIPT_PLACEHOLDER_RE.replace_all(html, |caps: &regex::Captures| {
        let attrs = &caps[1];
        let source = attr_value(attrs, "data-script").unwrap_or_default().to_string();
        let index = attr_value(attrs, "data-index").and_then(|i| i.parse::<usize>().ok());
        let expected = attr_value(attrs, "data-hash").unwrap_or_default();

        let source_groups = groups
            .entry(source.clone())
            .or_insert_with(|| load_code_table(layout, &source).map(|blocks| segment(&blocks)));
        let located = source_groups
            .as_deref()
            .zip(index)
            .and_then(|(groups, index)| locate(groups, index));

        let Some((group, offset)) = located else {
            return pending_notice(&format!("Running notebook {source}..."));
        };
        let block = &group.blocks[offset];
        if block.hash != expected {
            debug!(source = %source, index = block.index, "code table newer than compiled page");
            return cell_html(&block.code, None, &source);
        }

        let artifact = artifacts
            .entry(group.hash.clone())
            .or_insert_with(|| cache.load(&group.hash));
        let outputs = artifact
            .as_ref()
            .and_then(|a| a.cells.get(offset))
            .map(|cell| cell.outputs.as_slice());
        cell_html(&block.code, outputs, &source)
    });

    ensure_stylesheet(&replaced)
}

// ---------------------------------------------------------------------------
// Assets and live reload
// ---------------------------------------------------------------------------

/// Address the MathJax runtime relative to the served page. Pages without
/// math nodes are left alone.
pub fn fix_math_script(html: &str, layout: &ProjectLayout, rel: &str) -> String {
    if !MATH_NODE_RE.is_match(html) {
        return html.to_string();
    }
    let page_dir = layout
        .served_html(rel)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| layout.display_dir.clone());
    let src = relative_from(&page_dir, &layout.display_dir.join(MATHJAX_SCRIPT));
    let tag = format!(r#"<script id="MathJax-script" async src="{}">"#, escape_attr(&src));

    if MATHJAX_TAG_RE.is_match(html) {
        return MATHJAX_TAG_RE.replace_all(html, regex::NoExpand(tag.as_str())).into_owned();
    }
    match html.find("</head>") {
        Some(pos) => format!("{}{tag}</script>\n{}", &html[..pos], &html[pos..]),
        None => format!("{tag}</script>\n{html}"),
    }
}

/// Add the script that reloads the page when the build generation moves
/// and keeps the server's heartbeat fresh.
pub fn inject_live_reload(html: &str) -> String {
    let html = LIVE_RELOAD_RE.replace_all(html, "");
    let script = format!(
        r#"<script id="{LIVE_RELOAD_ID}">
(function () {{
  var seen = null;
  function poll() {{
    fetch("{GENERATION_PATH}", {{ cache: "no-store" }})
      .then(function (r) {{ return r.text(); }})
      .then(function (g) {{ if (seen !== null && g !== seen) {{ location.reload(); }} seen = g; }})
      .catch(function () {{}})
      .finally(function () {{ setTimeout(poll, 1000); }});
  }}
  poll();
}})();
</script>
"#
    );
    match html.rfind("</body>") {
        Some(pos) => format!("{}{script}{}", &html[..pos], &html[pos..]),
        None => format!("{html}{script}"),
    }
}

//! Navigation panel shared by every served page.
//!
//! The panel lists the render roots with their titles and, under the
//! current page, the page's own heading outline. It is applied last during
//! assembly; any panel already present is removed first.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use quire_shared::syntax::{escape_attr, escape_html};
use quire_shared::{ProjectLayout, relative_from};

/// Element id of the panel.
pub const NAV_ID: &str = "on-this-page";

const NAV_STYLE: &str = r#"<style id="on-this-page-style">
#on-this-page { position: fixed; top: 0; right: 0; width: 16em; max-height: 100vh; overflow-y: auto; padding: .5em 1em; font-size: .85em; background: #fafafa; border-left: 1px solid #ddd; }
#on-this-page h2 { font-size: 1em; margin: .3em 0; }
#on-this-page ul { list-style: none; padding-left: 1em; margin: 0; }
#on-this-page > ul { padding-left: 0; }
#on-this-page li.current > a { font-weight: bold; }
@media (min-width: 70em) { body { margin-right: 18em; } }
</style>"#;

static FRONT_MATTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n|\z)").expect("front matter regex")
});

static FIRST_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+?)\s*$").expect("heading regex"));

static NAV_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<nav\b[^>]*\bid="on-this-page"[^>]*>.*?</nav>\n?"#).expect("nav block regex")
});

static STYLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<style\b[^>]*>.*?</style>\n?").expect("style regex"));

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<script\b[^>]*>.*?</script>\n?").expect("script regex"));

static BODY_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<body\b[^>]*>").expect("body regex"));

static HEADING_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").expect("heading selector"));

// ---------------------------------------------------------------------------
// Pages and titles
// ---------------------------------------------------------------------------

/// One entry of the page list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavPage {
    pub rel: String,
    pub title: String,
}

/// Titles for the given render roots, in order.
pub fn nav_pages(layout: &ProjectLayout, roots: &[String]) -> Vec<NavPage> {
    roots
        .iter()
        .map(|rel| NavPage {
            rel: rel.clone(),
            title: read_title(&layout.source(rel)),
        })
        .collect()
}

/// Front-matter `title`, else the first level-one heading, else the file stem.
pub fn read_title(path: &Path) -> String {
    let stem = || {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let Ok(text) = std::fs::read_to_string(path) else {
        return stem();
    };

    if let Some(caps) = FRONT_MATTER_RE.captures(&text) {
        if let Ok(meta) = serde_yaml::from_str::<serde_yaml::Value>(&caps[1]) {
            match meta.get("title") {
                Some(serde_yaml::Value::String(title)) if !title.trim().is_empty() => {
                    return title.trim().to_string();
                }
                Some(serde_yaml::Value::Number(n)) => return n.to_string(),
                _ => {}
            }
        }
    }

    FIRST_HEADING_RE
        .captures(&text)
        .map(|c| c[1].to_string())
        .unwrap_or_else(stem)
}

// ---------------------------------------------------------------------------
// Outline
// ---------------------------------------------------------------------------

/// A heading of the assembled page, nested by level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub id: Option<String>,
    pub children: Vec<Heading>,
}

/// Outline of `h1`-`h6`, skipping the document title heading.
pub fn parse_headings(html: &str) -> Vec<Heading> {
    let document = Html::parse_document(html);
    let flat: Vec<Heading> = document
        .select(&HEADING_SEL)
        .filter(|el| !el.value().classes().any(|c| c == "title"))
        .filter_map(|el| {
            let level = el.value().name().strip_prefix('h')?.parse::<u8>().ok()?;
            let text = el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ");
            Some(Heading {
                level,
                text,
                id: el.value().attr("id").map(str::to_string),
                children: Vec::new(),
            })
        })
        .collect();

    let mut pos = 0;
    nest(&flat, &mut pos, 0)
}

/// Collect headings deeper than `parent_level` as siblings, each taking
/// the deeper headings that follow it as children.
fn nest(flat: &[Heading], pos: &mut usize, parent_level: u8) -> Vec<Heading> {
    let mut out = Vec::new();
    while *pos < flat.len() && flat[*pos].level > parent_level {
        let mut heading = flat[*pos].clone();
        *pos += 1;
        heading.children = nest(flat, pos, heading.level);
        out.push(heading);
    }
    out
}

// ---------------------------------------------------------------------------
// Applying the panel
// ---------------------------------------------------------------------------

/// Remove any panel, its stylesheet and scripts referring to it.
pub fn strip_navigation(html: &str) -> String {
    let html = NAV_BLOCK_RE.replace_all(html, "");
    let html = STYLE_RE.replace_all(&html, |caps: &regex::Captures| {
        if caps[0].contains("#on-this-page") {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    let html = SCRIPT_RE.replace_all(&html, |caps: &regex::Captures| {
        if caps[0].contains(NAV_ID) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    html.into_owned()
}

/// Replace the page's panel with a fresh one for `current`.
pub fn apply_navigation(html: &str, layout: &ProjectLayout, current: &str, pages: &[NavPage]) -> String {
    let html = strip_navigation(html);
    let outline = parse_headings(&html);
    let from_dir = layout
        .served_html(current)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| layout.display_dir.clone());

    let mut nav = format!(r#"<nav id="{NAV_ID}"><h2>On this page</h2><ul>"#);
    for page in pages {
        let href = relative_from(&from_dir, &layout.served_html(&page.rel));
        let title = if page.title.is_empty() { &page.rel } else { &page.title };
        if page.rel == current {
            nav.push_str(&format!(
                r#"<li class="current"><a href="{}">{}</a>{}</li>"#,
                escape_attr(&href),
                escape_html(title),
                outline_html(&outline)
            ));
        } else {
            nav.push_str(&format!(
                r#"<li><a href="{}">{}</a></li>"#,
                escape_attr(&href),
                escape_html(title)
            ));
        }
    }
    nav.push_str("</ul></nav>\n");
    debug!(page = %current, headings = outline.len(), "navigation applied");

    let html = match html.find("</head>") {
        Some(pos) => format!("{}{NAV_STYLE}\n{}", &html[..pos], &html[pos..]),
        None => format!("{NAV_STYLE}\n{html}"),
    };
    match BODY_OPEN_RE.find(&html) {
        Some(open) => format!("{}{nav}{}", &html[..open.end()], &html[open.end()..]),
        None => format!("{nav}{html}"),
    }
}

fn outline_html(headings: &[Heading]) -> String {
    if headings.is_empty() {
        return String::new();
    }
    let mut out = String::from("<ul>");
    for h in headings {
        let label = escape_html(&h.text);
        match &h.id {
            Some(id) => out.push_str(&format!(r##"<li><a href="#{}">{label}</a>"##, escape_attr(id))),
            None => out.push_str(&format!("<li>{label}")),
        }
        out.push_str(&outline_html(&h.children));
        out.push_str("</li>");
    }
    out.push_str("</ul>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_project() -> (PathBuf, ProjectLayout) {
        let dir = std::env::temp_dir().join(format!("quire-nav-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("notes")).unwrap();
        let layout = ProjectLayout::new(&dir).unwrap();
        (dir, layout)
    }

    #[test]
    fn title_prefers_front_matter_then_heading_then_stem() {
        let (dir, _) = temp_project();
        std::fs::write(dir.join("a.qmd"), "---\ntitle: Lab Notes\n---\n# Ignored\n").unwrap();
        std::fs::write(dir.join("b.qmd"), "intro\n\n# First Heading\n## sub\n").unwrap();
        std::fs::write(dir.join("c.qmd"), "no headings here\n").unwrap();

        assert_eq!(read_title(&dir.join("a.qmd")), "Lab Notes");
        assert_eq!(read_title(&dir.join("b.qmd")), "First Heading");
        assert_eq!(read_title(&dir.join("c.qmd")), "c");
        assert_eq!(read_title(&dir.join("missing.qmd")), "missing");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn headings_nest_by_level_and_skip_title() {
        let html = r#"<html><body><h1 class="title">Doc</h1>
            <h1 id="intro">Intro</h1><h2 id="a">A</h2><h3>A.1</h3><h2 id="b">B</h2>
            <h1 id="end">End</h1></body></html>"#;
        let outline = parse_headings(html);

        assert_eq!(outline.len(), 2);
        assert_eq!(outline[0].text, "Intro");
        assert_eq!(outline[0].children.len(), 2);
        assert_eq!(outline[0].children[0].children[0].text, "A.1");
        assert_eq!(outline[0].children[0].children[0].id, None);
        assert_eq!(outline[1].id.as_deref(), Some("end"));
    }

    #[test]
    fn navigation_links_are_relative_to_the_page() {
        let (dir, layout) = temp_project();
        let pages = vec![
            NavPage { rel: "index.qmd".into(), title: "Home".into() },
            NavPage { rel: "notes/day.qmd".into(), title: "Day".into() },
        ];
        let page = r#"<html><head></head><body><h2 id="x">X</h2></body></html>"#;

        let html = apply_navigation(page, &layout, "notes/day.qmd", &pages);
        assert!(html.contains(r#"<a href="../index.html">Home</a>"#));
        assert!(html.contains(r##"<li class="current"><a href="day.html">Day</a><ul><li><a href="#x">X</a></li></ul></li>"##));
        assert!(html.find("on-this-page-style").unwrap() < html.find("</head>").unwrap());
        assert!(html.find("<nav").unwrap() > html.find("<body>").unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let (dir, layout) = temp_project();
        let pages = vec![NavPage { rel: "index.qmd".into(), title: "Home".into() }];
        let page = r#"<html><head><style>p { color: blue; }</style></head><body><h1 id="a">A</h1></body></html>"#;

        let once = apply_navigation(page, &layout, "index.qmd", &pages);
        let twice = apply_navigation(&once, &layout, "index.qmd", &pages);
        assert_eq!(once, twice);
        assert_eq!(twice.matches("<nav").count(), 1);
        assert!(twice.contains("p { color: blue; }"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

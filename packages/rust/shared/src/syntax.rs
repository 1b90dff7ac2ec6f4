//! Source syntax recognized by the pipeline and the inert placeholder markup
//! that stands in for includes and code cells between staging and assembly.

use std::sync::LazyLock;

use regex::Regex;

// ---------------------------------------------------------------------------
// Source syntax (compiled once)
// ---------------------------------------------------------------------------

/// `{{< include path >}}` / `{{< embed path >}}`
pub static INCLUDE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*<\s*(include|embed)\s+([^>\s]+)\s*>\s*\}\}").expect("include regex")
});

/// A fenced Python cell: ```` ```{python ...}\n<code>``` ````
pub static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```\{python[^}]*\}\n(.*?)```").expect("code fence regex")
});

/// `![alt](target "title")`
pub static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").expect("image regex")
});

/// Anchor definitions `{#sec:id}`, `{#fig:id}`, `{#tab:id}`.
pub static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{#(sec|fig|tab):([A-Za-z0-9_-]+)\}").expect("anchor regex")
});

/// A heading carrying an anchor; group 2 is the heading text.
pub static HEADING_ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(#+)\s+(.*?)\s*\{#(sec|fig|tab):([A-Za-z0-9_-]+)\}").expect("heading anchor regex")
});

/// Cross-reference uses `@sec:id`.
pub static REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(sec|fig|tab):([A-Za-z0-9_-]+)").expect("reference regex")
});

/// A code cell starting with this marker opens a fresh kernel context.
pub const RESET_MARKER: &str = "%reset -f";

// ---------------------------------------------------------------------------
// Placeholders
// ---------------------------------------------------------------------------

/// Class carried by every visibly flagged stand-in.
pub const PENDING_CLASS: &str = "quire-pending";

/// An include placeholder `<div data-include=".." data-source=".."></div>`.
pub static INCLUDE_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<div\b([^>]*\bdata-(?:include|embed)="[^"]*"[^>]*)>\s*</div>"#)
        .expect("include placeholder regex")
});

/// A code placeholder `<div data-script=".." data-index=".." data-hash=".."></div>`.
pub static SCRIPT_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<div\b([^>]*\bdata-script="[^"]*"[^>]*)>\s*</div>"#)
        .expect("script placeholder regex")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)="([^"]*)""#).expect("attribute regex")
});

/// Markup for an include placeholder.
///
/// `relative` points at the target's staged HTML from the including file's
/// directory; `source` is the same file relative to the staging root.
pub fn include_placeholder(kind: &str, relative: &str, source: &str) -> String {
    format!(
        r#"<div data-{}="{}" data-source="{}"></div>"#,
        kind.to_lowercase(),
        escape_attr(relative),
        escape_attr(source)
    )
}

/// Markup for a code-cell placeholder.
pub fn script_placeholder(source: &str, index: usize, hash: &str) -> String {
    format!(
        r#"<div data-script="{}" data-index="{index}" data-hash="{hash}"></div>"#,
        escape_attr(source)
    )
}

/// Look up an attribute inside a captured attribute string.
pub fn attr_value<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    ATTR_RE
        .captures_iter(attrs)
        .find(|c| c.get(1).is_some_and(|m| m.as_str() == name))
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

/// Whether assembled HTML still holds any placeholder.
pub fn has_placeholders(html: &str) -> bool {
    INCLUDE_PLACEHOLDER_RE.is_match(html) || SCRIPT_PLACEHOLDER_RE.is_match(html)
}

/// Minimal attribute escaping for generated markup.
pub fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Escape text for HTML content.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// A red, bold notice that marks content still being produced.
pub fn pending_notice(message: &str) -> String {
    format!(
        r#"<div class="{PENDING_CLASS}" style="color:red;font-weight:bold">{}</div>"#,
        escape_html(message)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_pattern_matches_both_kinds() {
        let text = "a {{< include tasks.qmd >}} b {{<embed  sub/x.qmd>}}";
        let found: Vec<(String, String)> = INCLUDE_RE
            .captures_iter(text)
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .collect();
        assert_eq!(
            found,
            vec![
                ("include".to_string(), "tasks.qmd".to_string()),
                ("embed".to_string(), "sub/x.qmd".to_string())
            ]
        );
    }

    #[test]
    fn code_pattern_captures_body() {
        let text = "intro\n```{python}\nprint(2+2)\n```\nmid\n```{python echo=false}\nx = 1\n```\n";
        let bodies: Vec<&str> = CODE_RE
            .captures_iter(text)
            .map(|c| c.get(1).unwrap().as_str())
            .collect();
        assert_eq!(bodies, vec!["print(2+2)\n", "x = 1\n"]);
    }

    #[test]
    fn placeholder_roundtrip_through_patterns() {
        let inc = include_placeholder("include", "../tasks.html", "tasks.html");
        let caps = INCLUDE_PLACEHOLDER_RE.captures(&inc).unwrap();
        assert_eq!(attr_value(&caps[1], "data-source"), Some("tasks.html"));
        assert_eq!(attr_value(&caps[1], "data-include"), Some("../tasks.html"));

        let code = script_placeholder("tasks.qmd", 3, "abc");
        let caps = SCRIPT_PLACEHOLDER_RE.captures(&code).unwrap();
        assert_eq!(attr_value(&caps[1], "data-index"), Some("3"));
        assert!(has_placeholders(&format!("<p>x</p>{code}")));
        assert!(!has_placeholders("<div class=\"x\"></div>"));
    }

    #[test]
    fn compiler_reformatted_placeholder_still_matches() {
        let html = "<div data-source=\"b.html\" data-embed=\"b.html\">\n\n</div>";
        let caps = INCLUDE_PLACEHOLDER_RE.captures(html).unwrap();
        assert_eq!(attr_value(&caps[1], "data-source"), Some("b.html"));
    }

    #[test]
    fn pending_notice_is_flagged_and_escaped() {
        let notice = pending_notice("Running notebook <a>.qmd...");
        assert!(notice.contains(PENDING_CLASS));
        assert!(notice.contains("&lt;a&gt;"));
    }
}

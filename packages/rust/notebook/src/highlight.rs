//! Lightweight Python highlighting.
//!
//! A single-pass token classifier, emitting the short class names used by
//! common highlight stylesheets (`k`, `nb`, `s`, `c`, `m`, `nd`).

use std::sync::LazyLock;

use regex::Regex;

use quire_shared::syntax::escape_html;

/// Id of the injected stylesheet; used to inject it at most once.
pub const STYLESHEET_ID: &str = "quire-highlight";

/// Stylesheet for highlighted cells and their outputs.
pub const STYLESHEET: &str = r#"<style id="quire-highlight">
.highlight pre { background: #f6f8fa; padding: .6em .8em; border-radius: 4px; overflow-x: auto; }
.highlight .k { color: #008000; font-weight: bold; }
.highlight .nb { color: #008000; }
.highlight .s { color: #ba2121; }
.highlight .c { color: #408080; font-style: italic; }
.highlight .m { color: #666666; }
.highlight .nd { color: #aa22ff; }
.cell-output pre { margin: .2em 0 1em; }
</style>"#;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield", "match", "case",
];

const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "dict", "dir", "enumerate", "filter", "float", "format",
    "getattr", "hasattr", "int", "isinstance", "len", "list", "map", "max", "min", "next",
    "object", "open", "print", "range", "repr", "reversed", "round", "set", "setattr",
    "sorted", "str", "sum", "super", "tuple", "type", "zip",
];

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        (?P<comment>\#[^\n]*)
      | (?P<string>(?i:[rbuf]{0,2})(?:"""(?s:.*?)"""|'''(?s:.*?)'''|"(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*'))
      | (?P<decorator>@[A-Za-z_][A-Za-z0-9_.]*)
      | (?P<number>\b\d[\d_]*(?:\.\d*)?(?:[eE][+-]?\d+)?j?\b)
      | (?P<name>[A-Za-z_][A-Za-z0-9_]*)
        "#,
    )
    .expect("python token regex")
});

/// Highlight Python source into `<div class="highlight"><pre>…</pre></div>`.
pub fn highlight_python(code: &str) -> String {
    let mut out = String::with_capacity(code.len() * 2);
    let mut last = 0;

    for caps in TOKEN_RE.captures_iter(code) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&escape_html(&code[last..whole.start()]));
        let text = escape_html(whole.as_str());

        let class = if caps.name("comment").is_some() {
            Some("c")
        } else if caps.name("string").is_some() {
            Some("s")
        } else if caps.name("decorator").is_some() {
            Some("nd")
        } else if caps.name("number").is_some() {
            Some("m")
        } else if KEYWORDS.contains(&whole.as_str()) {
            Some("k")
        } else if BUILTINS.contains(&whole.as_str()) {
            Some("nb")
        } else {
            None
        };

        match class {
            Some(class) => out.push_str(&format!(r#"<span class="{class}">{text}</span>"#)),
            None => out.push_str(&text),
        }
        last = whole.end();
    }
    out.push_str(&escape_html(&code[last..]));

    format!(r#"<div class="highlight"><pre><code>{out}</code></pre></div>"#)
}

/// Add the stylesheet to a page once, in `<head>` when there is one.
pub fn ensure_stylesheet(html: &str) -> String {
    if html.contains(&format!(r#"id="{STYLESHEET_ID}""#)) {
        return html.to_string();
    }
    match html.find("</head>") {
        Some(pos) => format!("{}{STYLESHEET}\n{}", &html[..pos], &html[pos..]),
        None => format!("{STYLESHEET}\n{html}"),
    }
}

//! Rendering cell outputs into HTML.

use std::sync::LazyLock;

use regex::Regex;

use quire_shared::CellOutput;
use quire_shared::syntax::{escape_html, pending_notice};

use crate::highlight::highlight_python;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi regex")
});

/// Drop terminal escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

fn pre(text: &str, style: Option<&str>) -> String {
    let body = escape_html(&strip_ansi(text));
    match style {
        Some(style) => format!(r#"<pre style="{style}">{body}</pre>"#),
        None => format!("<pre>{body}</pre>"),
    }
}

/// HTML for one cell's outputs, in order.
pub fn outputs_to_html(outputs: &[CellOutput]) -> String {
    let mut parts = Vec::with_capacity(outputs.len());
    for output in outputs {
        match output {
            CellOutput::Stream { text, .. } => parts.push(pre(text, None)),
            CellOutput::DisplayData { data } | CellOutput::ExecuteResult { data } => {
                if let Some(html) = data.get("text/html") {
                    parts.push(html.clone());
                } else if let Some(png) = data.get("image/png") {
                    parts.push(format!(r#"<img src="data:image/png;base64,{}"/>"#, png.trim()));
                } else if let Some(jpeg) = data.get("image/jpeg") {
                    parts.push(format!(r#"<img src="data:image/jpeg;base64,{}"/>"#, jpeg.trim()));
                } else if let Some(plain) = data.get("text/plain") {
                    parts.push(pre(plain, None));
                }
            }
            CellOutput::Error {
                ename,
                evalue,
                traceback,
            } => {
                let tb = if traceback.is_empty() {
                    format!("{ename}: {evalue}")
                } else {
                    traceback
                        .iter()
                        .map(|l| l.trim_end_matches('\n'))
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                parts.push(pre(&tb, Some("color:red;")));
            }
        }
    }
    parts.join("\n")
}

/// Markup substituted for one code placeholder: highlighted source, then
/// either the outputs or a flagged notice while the notebook still runs.
pub fn cell_html(code: &str, outputs: Option<&[CellOutput]>, source: &str) -> String {
    let body = match outputs {
        Some(outputs) => format!(r#"<div class="cell-output">{}</div>"#, outputs_to_html(outputs)),
        None => pending_notice(&format!("Running notebook {source}...")),
    };
    format!(r#"<div class="cell">{}{body}</div>"#, highlight_python(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn stream_is_escaped_and_ansi_free() {
        let html = outputs_to_html(&[CellOutput::stdout("\x1b[31m<b>4</b>\x1b[0m\n")]);
        assert_eq!(html, "<pre>&lt;b&gt;4&lt;/b&gt;\n</pre>");
    }

    #[test]
    fn rich_data_prefers_html_then_images() {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), "<Figure>".to_string());
        data.insert("image/png".to_string(), "iVBOR".to_string());
        let html = outputs_to_html(&[CellOutput::DisplayData { data: data.clone() }]);
        assert_eq!(html, r#"<img src="data:image/png;base64,iVBOR"/>"#);

        data.insert("text/html".to_string(), "<table></table>".to_string());
        let html = outputs_to_html(&[CellOutput::ExecuteResult { data }]);
        assert_eq!(html, "<table></table>");
    }

    #[test]
    fn error_without_traceback_falls_back_to_name() {
        let html = outputs_to_html(&[CellOutput::Error {
            ename: "ValueError".into(),
            evalue: "bad".into(),
            traceback: vec![],
        }]);
        assert!(html.contains("color:red;"));
        assert!(html.contains("ValueError: bad"));
    }

    #[test]
    fn cell_without_outputs_is_flagged() {
        let html = cell_html("print(2+2)\n", None, "tasks.qmd");
        assert!(html.contains("quire-pending"));
        assert!(html.contains("Running notebook tasks.qmd..."));
        assert!(html.contains(r#"class="highlight""#));

        let done = cell_html("print(2+2)\n", Some(&[CellOutput::stdout("4\n")]), "tasks.qmd");
        assert!(!done.contains("quire-pending"));
        assert!(done.contains("<pre>4\n</pre>"));
    }
}

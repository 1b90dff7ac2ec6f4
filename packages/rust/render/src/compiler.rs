//! External document compiler.
//!
//! [`DocumentCompiler`] is the seam between the pipeline and pandoc; tests
//! plug in a fake that writes HTML directly.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, instrument};

use quire_shared::{CompilerConfig, MathMode, ProjectLayout, QuireError, Result, relative_from};

/// Lua filter copied into the staging tree before each build.
pub const LUA_FILTER: &str = "obs.lua";
/// Template used for fragments.
pub const BODY_TEMPLATE: &str = "body-only.html";
/// Template used for render roots.
pub const PAGE_TEMPLATE: &str = "pandoc_template.html";
/// MathJax entry point inside the served tree.
pub const MATHJAX_SCRIPT: &str = "mathjax/es5/tex-mml-chtml.js";

// ---------------------------------------------------------------------------
// Compile request
// ---------------------------------------------------------------------------

/// One staged source to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// Staged Markdown (absolute).
    pub source: PathBuf,
    /// HTML to produce (absolute).
    pub output: PathBuf,
    /// Body-only output for included fragments.
    pub fragment: bool,
    pub bibliography: Option<PathBuf>,
    pub csl: Option<PathBuf>,
    pub math: MathMode,
}

impl CompileRequest {
    /// Directory the compiler runs in.
    pub fn work_dir(&self) -> &Path {
        self.output.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Something that turns a staged source into HTML.
pub trait DocumentCompiler: Send + Sync {
    /// Blocking; runs on the compiler pool.
    fn compile(&self, request: &CompileRequest) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Pandoc
// ---------------------------------------------------------------------------

/// pandoc + pandoc-crossref, configured from `[compiler]`.
#[derive(Debug, Clone)]
pub struct PandocCompiler {
    program: String,
    crossref_filter: String,
    extra_args: Vec<String>,
    build_dir: PathBuf,
    display_dir: PathBuf,
    template_dir: PathBuf,
}

impl PandocCompiler {
    pub fn new(config: &CompilerConfig, layout: &ProjectLayout) -> Self {
        Self {
            program: config.program.clone(),
            crossref_filter: config.crossref_filter.clone(),
            extra_args: config.extra_args.clone(),
            build_dir: layout.build_dir.clone(),
            display_dir: layout.display_dir.clone(),
            template_dir: layout.template_dir.clone(),
        }
    }

    /// Check that pandoc and the crossref filter can be launched.
    pub fn ensure_available(&self) -> Result<()> {
        probe(
            &self.program,
            "pandoc is required but was not found on PATH; install it from https://pandoc.org/installing.html",
        )?;
        probe(
            &self.crossref_filter,
            "pandoc-crossref is required but was not found on PATH; install it from https://github.com/lierdakil/pandoc-crossref/releases",
        )
    }

    /// Arguments passed to pandoc, every path relative to the work dir.
    pub fn pandoc_args(&self, request: &CompileRequest) -> Vec<String> {
        let cwd = request.work_dir();
        let template = if request.fragment { BODY_TEMPLATE } else { PAGE_TEMPLATE };
        let math = match request.math {
            MathMode::WebTex => "--webtex".to_string(),
            MathMode::MathJax => format!(
                "--mathjax={}?config=TeX-AMS_CHTML",
                relative_from(cwd, &self.display_dir.join(MATHJAX_SCRIPT))
            ),
        };

        let mut args = vec![
            relative_from(cwd, &request.source),
            "--from".into(),
            "markdown+raw_html".into(),
            "--standalone".into(),
            "--embed-resources".into(),
            "--lua-filter".into(),
            relative_from(cwd, &self.build_dir.join(LUA_FILTER)),
            "--filter".into(),
            self.crossref_filter.clone(),
            "--citeproc".into(),
            math,
            "--template".into(),
            relative_from(cwd, &self.template_dir.join(template)),
            "-o".into(),
            relative_from(cwd, &request.output),
        ];
        if let Some(bib) = &request.bibliography {
            args.push("--bibliography".into());
            args.push(relative_from(cwd, bib));
        }
        if let Some(csl) = &request.csl {
            args.push("--csl".into());
            args.push(relative_from(cwd, csl));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl DocumentCompiler for PandocCompiler {
    #[instrument(skip_all, fields(source = %request.source.display()))]
    fn compile(&self, request: &CompileRequest) -> Result<()> {
        let args = self.pandoc_args(request);
        let invocation = format!("{} {}", self.program, args.join(" "));
        debug!(%invocation, "running compiler");

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(request.work_dir())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| QuireError::Compiler {
                diagnostics: e.to_string(),
                invocation: invocation.clone(),
            })?;

        if !output.status.success() {
            return Err(QuireError::Compiler {
                diagnostics: String::from_utf8_lossy(&output.stderr).into_owned(),
                invocation,
            });
        }
        Ok(())
    }
}

fn probe(program: &str, hint: &str) -> Result<()> {
    let status = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(s) if s.success() => Ok(()),
        _ => Err(QuireError::config(hint)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> PandocCompiler {
        PandocCompiler {
            program: "pandoc".into(),
            crossref_filter: "pandoc-crossref".into(),
            extra_args: vec![],
            build_dir: PathBuf::from("/p/_build"),
            display_dir: PathBuf::from("/p/_display"),
            template_dir: PathBuf::from("/p/_template"),
        }
    }

    #[test]
    fn fragment_args_are_relative_to_output_dir() {
        let request = CompileRequest {
            source: PathBuf::from("/p/_build/notes/tasks.qmd"),
            output: PathBuf::from("/p/_build/notes/tasks.html"),
            fragment: true,
            bibliography: Some(PathBuf::from("/p/refs.bib")),
            csl: None,
            math: MathMode::MathJax,
        };

        let args = compiler().pandoc_args(&request);
        assert_eq!(args[0], "tasks.qmd");
        assert!(args.contains(&"../obs.lua".to_string()));
        assert!(args.contains(&"../../_template/body-only.html".to_string()));
        assert!(args.contains(&"--mathjax=../../_display/mathjax/es5/tex-mml-chtml.js?config=TeX-AMS_CHTML".to_string()));
        let out = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(args[out + 1], "tasks.html");
        let bib = args.iter().position(|a| a == "--bibliography").unwrap();
        assert_eq!(args[bib + 1], "../../refs.bib");
        assert!(!args.contains(&"--csl".to_string()));
    }

    #[test]
    fn root_with_webtex_uses_page_template() {
        let request = CompileRequest {
            source: PathBuf::from("/p/_build/index.qmd"),
            output: PathBuf::from("/p/_build/index.html"),
            fragment: false,
            bibliography: None,
            csl: None,
            math: MathMode::WebTex,
        };

        let args = compiler().pandoc_args(&request);
        assert!(args.contains(&"--webtex".to_string()));
        assert!(args.contains(&"../_template/pandoc_template.html".to_string()));
    }

    #[test]
    fn missing_program_reports_invocation() {
        let mut c = compiler();
        c.program = format!("quire-no-such-compiler-{}", uuid::Uuid::now_v7());
        let request = CompileRequest {
            source: std::env::temp_dir().join("x.qmd"),
            output: std::env::temp_dir().join("x.html"),
            fragment: false,
            bibliography: None,
            csl: None,
            math: MathMode::WebTex,
        };

        match c.compile(&request).unwrap_err() {
            QuireError::Compiler { invocation, .. } => assert!(invocation.contains("x.qmd")),
            other => panic!("unexpected error {other}"),
        }
        assert!(c.ensure_available().is_err());
    }
}

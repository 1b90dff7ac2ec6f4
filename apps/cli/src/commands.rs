//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use quire_core::assembler::AssembledPage;
use quire_core::pipeline::{BuildProgress, Builder, CycleReport, SilentProgress};
use quire_core::{LiveOptions, init_project, watch_and_serve};
use quire_shared::{
    MathMode, ProjectLayout, QuireConfig, init_config, load_config, resolve_config_path,
};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// quire: incremental notebook builds with live preview.
#[derive(Parser)]
#[command(
    name = "quire",
    version,
    about = "Build a project of Markdown notebooks into linked HTML pages, incrementally.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Project root (the directory holding _quarto.yml).
    #[arg(long, default_value = ".", env = "QUIRE_PROJECT", global = true)]
    pub project: PathBuf,

    /// Tool config file (defaults to <project>/quire.toml, then ~/.quire/quire.toml).
    #[arg(long, env = "QUIRE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one full build cycle and wait for every notebook.
    Build {
        /// Render math as WebTeX images instead of the local MathJax copy.
        #[arg(long)]
        webtex: bool,
    },

    /// Build, serve the result and rebuild on every change.
    Watch {
        /// Serve and watch without opening a browser window.
        #[arg(long)]
        no_browser: bool,

        /// Render math as WebTeX images instead of the local MathJax copy.
        #[arg(long)]
        webtex: bool,

        /// Port for the preview server (overrides the config).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Write a sample project and the default templates.
    Init {
        /// Target directory (defaults to --project).
        path: Option<PathBuf>,

        /// Overwrite existing files.
        #[arg(long)]
        force: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

const LOG_TARGETS: &[&str] = &[
    "quire",
    "quire_core",
    "quire_shared",
    "quire_graph",
    "quire_stage",
    "quire_render",
    "quire_notebook",
    "quire_storage",
];

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = LOG_TARGETS
        .iter()
        .map(|t| format!("{t}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let project = cli.project.clone();
    let config = cli.config.clone();
    match cli.command {
        Command::Build { webtex } => cmd_build(&project, config.as_deref(), webtex).await,
        Command::Watch {
            no_browser,
            webtex,
            port,
        } => cmd_watch(&project, config.as_deref(), no_browser, webtex, port).await,
        Command::Init { path, force } => cmd_init(path.as_deref().unwrap_or(project.as_path()), force),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&project, config.as_deref()),
        },
    }
}

/// Layout and tool config for the project at `root`.
fn open_project(root: &Path, config: Option<&Path>, webtex: bool) -> Result<(ProjectLayout, QuireConfig)> {
    let layout = ProjectLayout::new(root)
        .map_err(|e| eyre!("cannot open project '{}': {e}", root.display()))?;
    let mut config = load_config(config, &layout.root)?;
    if webtex {
        config.build.math = MathMode::WebTex;
    }
    Ok((layout, config))
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl BuildProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_assembled(&self, page: &AssembledPage) {
        self.spinner.set_message(format!("Assembled {}", page.rel));
    }

    fn done(&self, _report: &CycleReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_build(root: &Path, config: Option<&Path>, webtex: bool) -> Result<()> {
    let (layout, config) = open_project(root, config, webtex)?;
    info!(root = %layout.root.display(), math = ?config.build.math, "building project");

    let mut builder = Builder::with_pandoc(layout, config)?;
    let progress = CliProgress::new();
    let report = builder.run_cycle(None, &progress).await?;
    progress.spinner.finish_and_clear();

    let finished = builder.finish_notebooks().await?;
    let still_pending: usize = finished.iter().map(|p| p.pending).sum();

    println!();
    if report.is_idle() {
        println!("  Everything up to date.");
    } else {
        println!("  Build complete.");
    }
    println!("  Staged:    {}", report.staged.len());
    println!("  Compiled:  {}", report.compiled.len());
    println!("  Pages:     {}", report.assembled.len());
    println!("  Notebooks: {}", report.notebook_groups);
    println!("  Output:    {}", builder.layout().display_dir.display());
    println!("  Time:      {:.1}s", report.elapsed.as_secs_f64());
    if still_pending > 0 {
        println!("  Pending:   {still_pending} placeholder(s) left on served pages");
    }

    let status = builder.node_status();
    if !status.is_empty() {
        println!();
        println!("  Needs attention:");
        for (path, tags) in status {
            println!("    {path}: {}", tags.join(", "));
        }
    }
    println!();

    Ok(())
}

async fn cmd_watch(
    root: &Path,
    config: Option<&Path>,
    no_browser: bool,
    webtex: bool,
    port: Option<u16>,
) -> Result<()> {
    let (layout, config) = open_project(root, config, webtex)?;
    let options = LiveOptions {
        port: port.unwrap_or(config.serve.port),
        open_browser: config.serve.open_browser && !no_browser,
    };
    info!(
        root = %layout.root.display(),
        port = options.port,
        browser = options.open_browser,
        "starting watch mode"
    );

    let mut builder = Builder::with_pandoc(layout, config)?.with_live_reload(true);
    let summary = watch_and_serve(&mut builder, options, &SilentProgress).await?;

    println!();
    println!("  Watch stopped.");
    println!("  Cycles:    {} ({} failed)", summary.cycles, summary.failed_cycles);
    println!("  Refreshes: {}", summary.refreshes);
    println!();

    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    let report = init_project(path, force)?;
    println!("Project initialized at: {}", report.root.display());
    for file in &report.written {
        println!("  wrote {}", file.display());
    }
    for file in &report.kept {
        println!("  kept  {} (use --force to overwrite)", file.display());
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(root: &Path, config: Option<&Path>) -> Result<()> {
    match resolve_config_path(config, root)? {
        Some(path) => println!("# {}", path.display()),
        None => println!("# defaults (no config file found)"),
    }
    let config: QuireConfig = load_config(config, root)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

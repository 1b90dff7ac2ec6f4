//! Tool configuration for quire.
//!
//! User config lives at `~/.quire/quire.toml`. A `quire.toml` in the project
//! root takes precedence, and an explicit `--config` path beats both.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{QuireError, Result};
use crate::types::MathMode;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "quire.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".quire";

// ---------------------------------------------------------------------------
// Config structs (matching quire.toml schema)
// ---------------------------------------------------------------------------

/// Top-level tool config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuireConfig {
    /// Build pools and modes.
    #[serde(default)]
    pub build: BuildConfig,

    /// External document compiler.
    #[serde(default)]
    pub compiler: CompilerConfig,

    /// Code kernel used for notebook cells.
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Watch/serve settings.
    #[serde(default)]
    pub serve: ServeConfig,
}

/// `[build]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Concurrent compiler invocations.
    #[serde(default = "default_workers")]
    pub compile_workers: usize,

    /// Concurrent notebook groups.
    #[serde(default = "default_workers")]
    pub notebook_workers: usize,

    /// Math rendering mode.
    #[serde(default)]
    pub math: MathMode,

    /// Maximum include nesting resolved during page assembly.
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            compile_workers: default_workers(),
            notebook_workers: default_workers(),
            math: MathMode::default(),
            max_include_depth: default_max_include_depth(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_max_include_depth() -> usize {
    64
}

/// `[compiler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Compiler executable.
    #[serde(default = "default_compiler_program")]
    pub program: String,

    /// Cross-reference filter passed via `--filter`.
    #[serde(default = "default_crossref_filter")]
    pub crossref_filter: String,

    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: default_compiler_program(),
            crossref_filter: default_crossref_filter(),
            extra_args: Vec::new(),
        }
    }
}

fn default_compiler_program() -> String {
    "pandoc".into()
}
fn default_crossref_filter() -> String {
    "pandoc-crossref".into()
}

/// `[kernel]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Interpreter that runs the kernel bridge script.
    #[serde(default = "default_kernel_program")]
    pub program: String,

    /// Extra interpreter arguments placed before the script path.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            program: default_kernel_program(),
            args: Vec::new(),
        }
    }
}

fn default_kernel_program() -> String {
    "python3".into()
}

/// `[serve]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// HTTP port for the preview server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Open a browser window when watching.
    #[serde(default = "default_true")]
    pub open_browser: bool,

    /// Quiet period before a batch of file changes triggers a rebuild.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Seconds without a page heartbeat before the browser counts as closed.
    #[serde(default = "default_browser_timeout")]
    pub browser_timeout_secs: u64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            open_browser: true,
            debounce_ms: default_debounce_ms(),
            browser_timeout_secs: default_browser_timeout(),
        }
    }
}

fn default_port() -> u16 {
    8000
}
fn default_true() -> bool {
    true
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_browser_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.quire/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| QuireError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the user config file (`~/.quire/quire.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve which config file applies to a project.
///
/// Order: explicit path, `<project>/quire.toml`, `~/.quire/quire.toml`.
/// Returns `None` when none of them exists.
pub fn resolve_config_path(explicit: Option<&Path>, project_root: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(QuireError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let local = project_root.join(CONFIG_FILE_NAME);
    if local.exists() {
        return Ok(Some(local));
    }

    let user = config_file_path()?;
    Ok(user.exists().then_some(user))
}

/// Load the tool config for a project. Returns defaults if no file exists.
pub fn load_config(explicit: Option<&Path>, project_root: &Path) -> Result<QuireConfig> {
    match resolve_config_path(explicit, project_root)? {
        Some(path) => load_config_from(&path),
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(QuireConfig::default())
        }
    }
}

/// Load the tool config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<QuireConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| QuireError::io(path, e))?;

    let config: QuireConfig = toml::from_str(&content)
        .map_err(|e| QuireError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings that would stall the pipeline.
pub fn validate(config: &QuireConfig) -> Result<()> {
    if config.build.compile_workers == 0 {
        return Err(QuireError::config("build.compile_workers must be at least 1"));
    }
    if config.build.notebook_workers == 0 {
        return Err(QuireError::config("build.notebook_workers must be at least 1"));
    }
    if config.build.max_include_depth == 0 {
        return Err(QuireError::config("build.max_include_depth must be at least 1"));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| QuireError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = QuireConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| QuireError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| QuireError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

//! Shared types, error model, and configuration for quire.
//!
//! This crate is the foundation depended on by all other quire crates.
//! It provides:
//! - [`QuireError`]: the unified error type
//! - [`ProjectLayout`]: the explicit per-project directory configuration
//! - Domain types ([`CodeBlock`], [`CellOutput`], [`NotebookArtifact`])
//! - Configuration ([`QuireConfig`] from TOML, [`ProjectConfig`] from `_quarto.yml`)
//! - Source syntax patterns and placeholder markup ([`syntax`])

pub mod config;
pub mod error;
pub mod fs;
pub mod layout;
pub mod project;
pub mod syntax;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    BuildConfig, CompilerConfig, KernelConfig, QuireConfig, ServeConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, resolve_config_path,
};
pub use error::{QuireError, Result};
pub use fs::{write_atomic, write_json_atomic};
pub use layout::{ProjectLayout, html_name, normalize, relative_from, to_posix};
pub use project::{PROJECT_FILE_NAME, ProjectConfig, load_project, parse_project};
pub use types::{
    CURRENT_SCHEMA_VERSION, CellOutput, CellRecord, CodeBlock, MathMode, NotebookArtifact,
    PREVIOUS_CELL_FAILED, SourceKind, content_hash, hash_bytes,
};

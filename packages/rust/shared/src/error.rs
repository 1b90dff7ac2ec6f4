//! Error types for quire.
//!
//! Library crates use [`QuireError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all quire operations.
#[derive(Debug, thiserror::Error)]
pub enum QuireError {
    /// Tool or project configuration loading/validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// More than one candidate for a setting that must be unique.
    #[error("ambiguous project configuration: {message}")]
    AmbiguousConfig { message: String },

    /// Source or HTML parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An include directive whose target exists in none of the search dirs.
    #[error("include file '{include}' not found for '{}'", includer.display())]
    UnresolvedInclude { include: String, includer: PathBuf },

    /// Include directives that loop back on themselves.
    #[error("cyclic include: {chain}")]
    CyclicInclude { chain: String },

    /// The external document compiler failed.
    #[error("{diagnostics}\nwhen trying to run: {invocation}")]
    Compiler {
        diagnostics: String,
        invocation: String,
    },

    /// Kernel bridge failure (spawn, protocol, or crash).
    #[error("kernel error: {0}")]
    Kernel(String),

    /// HTTP server error.
    #[error("server error: {0}")]
    Server(String),

    /// File watcher error.
    #[error("watch error: {0}")]
    Watch(String),

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, QuireError>;

impl QuireError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an ambiguous-config error.
    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::AmbiguousConfig {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a kernel error.
    pub fn kernel(msg: impl Into<String>) -> Self {
        Self::Kernel(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = QuireError::config("missing render list");
        assert_eq!(err.to_string(), "config error: missing render list");

        let err = QuireError::validation("schema_version 99 not supported");
        assert!(err.to_string().contains("schema_version 99"));
    }

    #[test]
    fn unresolved_include_names_both_sides() {
        let err = QuireError::UnresolvedInclude {
            include: "missing.qmd".into(),
            includer: PathBuf::from("/proj/index.qmd"),
        };
        let text = err.to_string();
        assert!(text.contains("missing.qmd"));
        assert!(text.contains("/proj/index.qmd"));
    }

    #[test]
    fn compiler_error_carries_invocation() {
        let err = QuireError::Compiler {
            diagnostics: "pandoc: unknown option".into(),
            invocation: "pandoc a.qmd -o a.html".into(),
        };
        assert_eq!(
            err.to_string(),
            "pandoc: unknown option\nwhen trying to run: pandoc a.qmd -o a.html"
        );
    }
}

//! Core domain types shared across the build pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current schema version for persisted notebook artifacts.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Stderr text recorded on every cell after a failing one.
pub const PREVIOUS_CELL_FAILED: &str = "previous cell failed to execute\n";

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of arbitrary bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of text content.
pub fn content_hash(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Role of a source file in the include graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Declared in `project.render`; compiled into a served page.
    RenderRoot,
    /// Included by another document; compiled to a body snippet.
    Fragment,
}

/// How math is rendered by the compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MathMode {
    /// Local MathJax copy served from the display tree.
    #[default]
    MathJax,
    /// Images from a WebTeX service.
    WebTex,
}

/// One executable code fence found while staging a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Project-relative source path.
    pub source: String,
    /// 1-based position among the source's code blocks.
    pub index: usize,
    /// Code text as written in the fence.
    pub code: String,
    /// Content hash of `code`.
    pub hash: String,
}

impl CodeBlock {
    pub fn new(source: impl Into<String>, index: usize, code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            source: source.into(),
            index,
            hash: content_hash(&code),
            code,
        }
    }
}

// ---------------------------------------------------------------------------
// Notebook outputs
// ---------------------------------------------------------------------------

/// A single cell output, following the notebook output model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum CellOutput {
    Stream {
        name: String,
        text: String,
    },
    DisplayData {
        data: BTreeMap<String, String>,
    },
    ExecuteResult {
        data: BTreeMap<String, String>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl CellOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stream {
            name: "stdout".into(),
            text: text.into(),
        }
    }

    /// Marker recorded on cells that were skipped after a failure.
    pub fn previous_failed() -> Self {
        Self::Stream {
            name: "stderr".into(),
            text: PREVIOUS_CELL_FAILED.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Code and outputs of one executed cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub code: String,
    pub outputs: Vec<CellOutput>,
}

/// The persisted result of executing one notebook group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookArtifact {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Group hash the artifact is stored under.
    pub hash: String,
    /// Source that first produced the artifact (informational).
    pub source: String,
    /// When the group was executed.
    pub executed_at: DateTime<Utc>,
    /// Per-cell results in execution order.
    pub cells: Vec<CellRecord>,
}

impl NotebookArtifact {
    pub fn new(hash: impl Into<String>, source: impl Into<String>, cells: Vec<CellRecord>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            hash: hash.into(),
            source: source.into(),
            executed_at: Utc::now(),
            cells,
        }
    }

    /// Whether any cell recorded an error.
    pub fn has_error(&self) -> bool {
        self.cells.iter().any(|c| c.outputs.iter().any(CellOutput::is_error))
    }
}

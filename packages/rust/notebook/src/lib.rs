//! Notebook execution for quire.
//!
//! Python cells found while staging are split into groups ([`segment`]),
//! executed on a dedicated pool through a [`Kernel`] ([`runner`]), cached by
//! content hash, and rendered back into HTML ([`output`], [`highlight`]).

pub mod highlight;
pub mod kernel;
pub mod output;
pub mod runner;
pub mod segment;

pub use highlight::{STYLESHEET, ensure_stylesheet, highlight_python};
pub use kernel::{BridgeKernel, Kernel, KernelSession, execute_group};
pub use output::{cell_html, outputs_to_html, strip_ansi};
pub use runner::{GroupOutcome, NotebookEvent, NotebookRunner};
pub use segment::{NotebookGroup, group_hash, locate, segment};

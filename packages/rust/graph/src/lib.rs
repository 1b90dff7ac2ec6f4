//! Source graph for quire.
//!
//! - [`analyzer`] resolves include directives into an [`IncludeGraph`]
//! - [`registry`] tracks per-file build state and build order
//! - [`anchors`] indexes cross-reference targets and rewrites references

pub mod analyzer;
pub mod anchors;
pub mod registry;

pub use analyzer::{IncludeGraph, analyze_includes, resolve_include};
pub use anchors::{Anchor, AnchorIndex, collect_anchors, rewrite_refs};
pub use registry::{RenderNode, RenderRegistry, StatusTag};

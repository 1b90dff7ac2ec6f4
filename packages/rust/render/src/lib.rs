//! Document compilation for quire.
//!
//! - [`DocumentCompiler`]: seam over the external compiler
//! - [`PandocCompiler`]: pandoc + pandoc-crossref invocation
//! - [`RenderExecutor`]: bounded concurrent compile pool

pub mod compiler;
pub mod executor;

pub use compiler::{
    BODY_TEMPLATE, CompileRequest, DocumentCompiler, LUA_FILTER, MATHJAX_SCRIPT, PAGE_TEMPLATE,
    PandocCompiler,
};
pub use executor::{RenderExecutor, RenderJob};

//! Build orchestration for quire projects.
//!
//! This crate ties the include graph, staging, compilation and notebook
//! execution together into incremental build cycles ([`pipeline`]), turns
//! staged output into served pages ([`assembler`], [`nav`]) and drives watch
//! mode ([`live`]) with its watcher, preview server and browser.

pub mod assembler;
pub mod browser;
pub mod live;
pub mod nav;
pub mod pipeline;
pub mod scaffold;
pub mod server;
pub mod watcher;

pub use assembler::{AssembledPage, assemble_page};
pub use live::{LiveOptions, LiveSummary, watch_and_serve};
pub use pipeline::{BuildProgress, Builder, CycleReport, SilentProgress};
pub use scaffold::{InitReport, init_project};

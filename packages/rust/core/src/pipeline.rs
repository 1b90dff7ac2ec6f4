//! Incremental build cycle: analyze → stage → (notebooks ∥ compile) → assemble.
//!
//! A [`Builder`] lives for the whole process. It owns the checksum store,
//! the compiler pool and the notebook runner, and is the only place where
//! served pages are written. Notebook workers report back through
//! [`NotebookEvent`]s, which the owner of the builder feeds into
//! [`Builder::apply_notebook_events`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, instrument, warn};

use quire_graph::{IncludeGraph, RenderRegistry, analyze_includes, collect_anchors};
use quire_notebook::{BridgeKernel, GroupOutcome, Kernel, NotebookEvent, NotebookRunner};
use quire_render::{CompileRequest, DocumentCompiler, PandocCompiler, RenderExecutor, RenderJob};
use quire_shared::{ProjectConfig, ProjectLayout, QuireConfig, Result, load_project};
use quire_stage::stage_sources;
use quire_storage::{ChecksumStore, NotebookCache};

use crate::assembler::{AssembledPage, AssemblyContext, assemble_page};
use crate::nav::{NavPage, nav_pages};
use crate::scaffold::prepare_build_tree;

// ---------------------------------------------------------------------------
// Progress and reports
// ---------------------------------------------------------------------------

/// Outcome of one build cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Sources re-staged this cycle.
    pub staged: Vec<String>,
    /// Sources handed to the compiler.
    pub compiled: Vec<String>,
    /// Served pages written at the end of the cycle.
    pub assembled: Vec<String>,
    /// Assembled pages still showing a flagged notice.
    pub pending_pages: usize,
    /// Notebook groups launched.
    pub notebook_groups: usize,
    /// Checksum entries written.
    pub checksum_updates: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    /// Nothing was staged or assembled.
    pub fn is_idle(&self) -> bool {
        self.staged.is_empty() && self.assembled.is_empty()
    }
}

/// Progress callback for reporting cycle status.
pub trait BuildProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each served page is written.
    fn page_assembled(&self, page: &AssembledPage);
    /// Called when the cycle completes.
    fn done(&self, report: &CycleReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BuildProgress for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_assembled(&self, _page: &AssembledPage) {}
    fn done(&self, _report: &CycleReport) {}
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Graph and navigation of the last analyzed cycle, used to route notebook
/// completions to the pages that show them.
struct CycleState {
    graph: IncludeGraph,
    registry: RenderRegistry,
    pages: Vec<NavPage>,
}

/// Owns all cross-cycle build state for one project.
pub struct Builder {
    layout: ProjectLayout,
    config: QuireConfig,
    live_reload: bool,
    executor: RenderExecutor,
    notebooks: NotebookRunner,
    events: UnboundedReceiver<NotebookEvent>,
    checksums: ChecksumStore,
    /// Source → group hashes launched and not reported yet.
    pending: BTreeMap<String, BTreeSet<String>>,
    state: Option<CycleState>,
}

impl Builder {
    pub fn new(
        layout: ProjectLayout,
        config: QuireConfig,
        compiler: Arc<dyn DocumentCompiler>,
        kernel: Arc<dyn Kernel>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let notebooks = NotebookRunner::new(
            kernel,
            NotebookCache::new(&layout.cache_dir),
            &layout.root,
            config.build.notebook_workers,
            tx,
        );
        Self {
            executor: RenderExecutor::new(compiler, config.build.compile_workers),
            checksums: ChecksumStore::load(&layout.checksum_path()),
            notebooks,
            events: rx,
            pending: BTreeMap::new(),
            state: None,
            live_reload: false,
            layout,
            config,
        }
    }

    /// Builder driving pandoc and the Python kernel bridge. Fails when the
    /// compiler toolchain is not installed.
    pub fn with_pandoc(layout: ProjectLayout, config: QuireConfig) -> Result<Self> {
        let compiler = PandocCompiler::new(&config.compiler, &layout);
        compiler.ensure_available()?;
        let kernel = BridgeKernel::new(&config.kernel);
        Ok(Self::new(layout, config, Arc::new(compiler), Arc::new(kernel)))
    }

    /// Add the live-reload beacon to every assembled page.
    pub fn with_live_reload(mut self, enabled: bool) -> Self {
        self.live_reload = enabled;
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn config(&self) -> &QuireConfig {
        &self.config
    }

    pub fn checksums(&self) -> &ChecksumStore {
        &self.checksums
    }

    /// Render roots of the last analyzed cycle, in configuration order.
    pub fn render_roots(&self) -> &[String] {
        self.state
            .as_ref()
            .map(|s| s.graph.render_roots.as_slice())
            .unwrap_or_default()
    }

    /// Sources that still carry diagnostic status tags, with the tags.
    pub fn node_status(&self) -> Vec<(String, Vec<String>)> {
        let Some(state) = &self.state else {
            return Vec::new();
        };
        state
            .registry
            .nodes()
            .filter(|n| !n.status.is_empty())
            .map(|n| (n.path.clone(), n.status.iter().map(ToString::to_string).collect()))
            .collect()
    }

    /// Notebook groups launched and not reported yet.
    pub fn pending_notebooks(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    // -----------------------------------------------------------------------
    // Cycle
    // -----------------------------------------------------------------------

    /// Run one build cycle. `None` checks every source against the checksum
    /// store; `Some(paths)` additionally forces the given project-relative
    /// sources and scopes reassembly to the roots that show them.
    ///
    /// Any compiler failure aborts the cycle before checksums are committed,
    /// so the failed sources are retried next time.
    #[instrument(skip_all, fields(changed = changed.map_or(0, |c| c.len())))]
    pub async fn run_cycle(
        &mut self,
        changed: Option<&BTreeSet<String>>,
        progress: &dyn BuildProgress,
    ) -> Result<CycleReport> {
        let start = Instant::now();
        let math = self.config.build.math;

        progress.phase("Analyzing project");
        prepare_build_tree(&self.layout, math)?;
        let project = load_project(&self.layout)?;
        let graph = analyze_includes(&self.layout, &project.render)?;
        let mut registry = RenderRegistry::new(&self.layout, &graph);
        let outdated = registry.mark_outdated(&self.checksums);
        let staged = registry.stage_targets(changed);

        let display: BTreeSet<String> = match changed {
            None => graph
                .render_roots
                .iter()
                .chain(&graph.missing_roots)
                .cloned()
                .collect(),
            Some(changed) => {
                let seeds: BTreeSet<String> = staged.iter().chain(changed).cloned().collect();
                let mut display = graph.affected_roots(&seeds);
                // A deleted root has no node left; it still gets its notice page.
                display.extend(graph.missing_roots.iter().filter(|r| changed.contains(*r)).cloned());
                display
            }
        };
        let display_len = display.len();
        debug!(
            outdated = outdated.len(),
            staged = staged.len(),
            display = display_len,
            "cycle scope"
        );

        if staged.is_empty() && display.is_empty() {
            info!("nothing to rebuild");
            let report = CycleReport {
                elapsed: start.elapsed(),
                ..Default::default()
            };
            self.state = Some(CycleState {
                pages: nav_pages(&self.layout, &graph.render_roots),
                graph,
                registry,
            });
            progress.done(&report);
            return Ok(report);
        }

        progress.phase("Staging sources");
        let anchors = collect_anchors(&self.layout, &graph);
        let tables = stage_sources(&self.layout, &graph, &anchors, &staged)?;

        let groups = self.notebooks.launch(&tables);
        for group in &groups {
            self.pending
                .entry(group.source.clone())
                .or_default()
                .insert(group.hash.clone());
        }

        let pages = nav_pages(&self.layout, &graph.render_roots);
        let targets = ordered_roots(&graph, &display);

        // First visit: give new pages something to show while compiling.
        let fresh: Vec<String> = targets
            .iter()
            .filter(|rel| !self.layout.served_html(rel).exists())
            .cloned()
            .collect();
        if !fresh.is_empty() {
            progress.phase("Writing placeholder pages");
            self.assemble(&pages, &fresh, &|_| {})?;
        }

        progress.phase("Compiling");
        let jobs = compile_jobs(&self.layout, &graph, &registry, &staged, &project, math);
        let compiled = self.executor.run(jobs).await?;

        let checksum_updates = registry.update_checksums(&mut self.checksums);
        self.checksums.save()?;

        // Completions that raced the compiler are already on disk and are
        // picked up by the assembly below.
        while let Ok(event) = self.events.try_recv() {
            self.record_completion(&event);
        }

        progress.phase("Assembling pages");
        let assembled = self.assemble(&pages, &targets, &|page| progress.page_assembled(page))?;

        let pending_sources: BTreeSet<String> = self.pending.keys().cloned().collect();
        registry.refresh_status_tags(&self.layout, &pending_sources);

        let report = CycleReport {
            staged,
            compiled,
            pending_pages: assembled.iter().filter(|p| !p.is_complete()).count(),
            assembled: assembled.into_iter().map(|p| p.rel).collect(),
            notebook_groups: groups.len(),
            checksum_updates,
            elapsed: start.elapsed(),
        };
        info!(
            staged = report.staged.len(),
            compiled = report.compiled.len(),
            assembled = report.assembled.len(),
            notebook_groups = report.notebook_groups,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "build cycle complete"
        );

        self.state = Some(CycleState {
            graph,
            registry,
            pages,
        });
        progress.done(&report);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Notebook completions
    // -----------------------------------------------------------------------

    /// Wait for the next notebook completion.
    pub async fn next_event(&mut self) -> Option<NotebookEvent> {
        self.events.recv().await
    }

    /// Completions already queued, without waiting.
    pub fn ready_events(&mut self) -> Vec<NotebookEvent> {
        self.notebooks.reap();
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Record completions and reassemble, once, every page showing one of
    /// the finished sources.
    pub fn apply_notebook_events(&mut self, events: &[NotebookEvent]) -> Result<Vec<AssembledPage>> {
        let mut sources = BTreeSet::new();
        for event in events {
            if self.record_completion(event) {
                sources.insert(event.source.clone());
            }
        }
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        let roots = ordered_roots(&state.graph, &state.graph.affected_roots(&sources));
        debug!(sources = sources.len(), pages = roots.len(), "substituting notebook outputs");
        let assembled = self.assemble(&state.pages, &roots, &|_| {})?;

        let pending: BTreeSet<String> = self.pending.keys().cloned().collect();
        if let Some(state) = self.state.as_mut() {
            state.registry.refresh_status_tags(&self.layout, &pending);
        }
        Ok(assembled)
    }

    /// Wait for every launched notebook group and substitute its outputs.
    pub async fn finish_notebooks(&mut self) -> Result<Vec<AssembledPage>> {
        self.notebooks.drain().await;
        let events = self.ready_events();
        self.apply_notebook_events(&events)
    }

    /// Reassemble every page of the last cycle from what is on disk.
    pub fn reassemble_all(&self) -> Result<Vec<AssembledPage>> {
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };
        let all: BTreeSet<String> = state
            .graph
            .render_roots
            .iter()
            .chain(&state.graph.missing_roots)
            .cloned()
            .collect();
        self.assemble(&state.pages, &ordered_roots(&state.graph, &all), &|_| {})
    }

    /// Forget a completed group. Returns whether its outputs are worth
    /// substituting.
    fn record_completion(&mut self, event: &NotebookEvent) -> bool {
        if let Some(hashes) = self.pending.get_mut(&event.source) {
            hashes.remove(&event.hash);
            if hashes.is_empty() {
                self.pending.remove(&event.source);
            }
        }
        match &event.outcome {
            GroupOutcome::Cached => true,
            GroupOutcome::Executed { failed } => {
                if *failed {
                    warn!(source = %event.source, hash = %event.hash, "notebook group raised an error");
                }
                true
            }
            GroupOutcome::StoreFailed(reason) => {
                warn!(source = %event.source, %reason, "notebook outputs were not stored");
                false
            }
        }
    }

    fn assemble(
        &self,
        pages: &[NavPage],
        roots: &[String],
        on_page: &dyn Fn(&AssembledPage),
    ) -> Result<Vec<AssembledPage>> {
        let ctx = AssemblyContext {
            layout: &self.layout,
            cache: self.notebooks.cache(),
            pages,
            math: self.config.build.math,
            max_include_depth: self.config.build.max_include_depth,
            live_reload: self.live_reload,
        };
        let mut assembled = Vec::with_capacity(roots.len());
        for rel in roots {
            let page = assemble_page(&ctx, rel)?;
            on_page(&page);
            assembled.push(page);
        }
        Ok(assembled)
    }
}

/// `set`, in configuration order.
fn ordered_roots(graph: &IncludeGraph, set: &BTreeSet<String>) -> Vec<String> {
    graph
        .render_roots
        .iter()
        .chain(&graph.missing_roots)
        .filter(|r| set.contains(*r))
        .cloned()
        .collect()
}

fn compile_jobs(
    layout: &ProjectLayout,
    graph: &IncludeGraph,
    registry: &RenderRegistry,
    staged: &[String],
    project: &ProjectConfig,
    math: quire_shared::MathMode,
) -> Vec<RenderJob> {
    let staged: BTreeSet<&String> = staged.iter().collect();
    registry
        .render_order()
        .into_iter()
        .filter(|rel| staged.contains(rel))
        .map(|rel| RenderJob {
            request: CompileRequest {
                source: layout.staged_source(&rel),
                output: layout.staged_html(&rel),
                fragment: !graph.is_render_root(&rel),
                bibliography: project.bibliography.clone(),
                csl: project.csl.clone(),
                math,
            },
            target: rel,
        })
        .collect()
}

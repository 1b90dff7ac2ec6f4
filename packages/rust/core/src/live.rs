//! Watch mode: rebuild on change, serve the result, keep the browser fresh.
//!
//! One loop owns the [`Builder`]. Rebuilds run to completion before the
//! next batch of changes is looked at; edits made meanwhile wait in the
//! watcher channel. Notebook completions are folded in between cycles.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use quire_shared::Result;

use crate::browser::{Browser, NoBrowser, SystemBrowser};
use crate::pipeline::{BuildProgress, Builder};
use crate::server::{PreviewServer, ReloadState};
use crate::watcher::ProjectWatcher;

const LIVENESS_TICK: Duration = Duration::from_secs(1);

/// Options of `quire watch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveOptions {
    pub port: u16,
    pub open_browser: bool,
}

/// What happened during a watch session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSummary {
    pub cycles: usize,
    pub failed_cycles: usize,
    pub refreshes: usize,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    BrowserClosed,
    WatcherClosed,
}

/// Build, serve and watch until Ctrl-C or the browser window goes away.
pub async fn watch_and_serve(
    builder: &mut Builder,
    options: LiveOptions,
    progress: &dyn BuildProgress,
) -> Result<LiveSummary> {
    let serve = builder.config().serve.clone();
    let watcher = ProjectWatcher::start(builder.layout(), Duration::from_millis(serve.debounce_ms))?;
    let reload = Arc::new(ReloadState::new());
    let browser: Box<dyn Browser> = if options.open_browser {
        Box::new(SystemBrowser::new(
            reload.clone(),
            Duration::from_secs(serve.browser_timeout_secs),
        ))
    } else {
        Box::new(NoBrowser)
    };

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    run_live(builder, watcher, browser.as_ref(), reload, options.port, progress, interrupt).await
}

/// The watch loop over explicit collaborators. Stops when `shutdown`
/// resolves, the browser is gone or the watcher closes, then drains
/// notebook work and stops the server.
pub(crate) async fn run_live(
    builder: &mut Builder,
    mut watcher: ProjectWatcher,
    browser: &dyn Browser,
    reload: Arc<ReloadState>,
    port: u16,
    progress: &dyn BuildProgress,
    shutdown: impl Future<Output = ()>,
) -> Result<LiveSummary> {
    let mut summary = LiveSummary::default();

    summary.cycles += 1;
    if let Err(e) = builder.run_cycle(None, progress).await {
        summary.failed_cycles += 1;
        error!(error = %e, "initial build failed; waiting for changes");
    }

    let server = PreviewServer::start(builder.layout(), port, reload).await?;
    if let Some(first) = builder.render_roots().first() {
        browser.navigate_to(&server.url_for(first));
    }

    let mut tick = tokio::time::interval(LIVENESS_TICK);
    tokio::pin!(shutdown);

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => break StopReason::Interrupted,

            batch = watcher.next_batch() => {
                let Some(changed) = batch else {
                    break StopReason::WatcherClosed;
                };
                info!(files = changed.len(), "change detected");
                summary.cycles += 1;
                match builder.run_cycle(Some(&changed), progress).await {
                    Ok(report) if !report.is_idle() => {
                        browser.refresh();
                        summary.refreshes += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        summary.failed_cycles += 1;
                        error!(error = %e, "build failed; fix the sources and save again");
                    }
                }
            }

            Some(event) = builder.next_event() => {
                let mut events = vec![event];
                events.extend(builder.ready_events());
                match builder.apply_notebook_events(&events) {
                    Ok(pages) if !pages.is_empty() => {
                        browser.refresh();
                        summary.refreshes += 1;
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "could not substitute notebook outputs"),
                }
            }

            _ = tick.tick() => {
                if !browser.is_alive() {
                    break StopReason::BrowserClosed;
                }
            }
        }
    };
    info!(?reason, "stopping");

    watcher.stop();
    if let Err(e) = builder.finish_notebooks().await {
        warn!(error = %e, "notebook outputs not applied during shutdown");
    }
    server.shutdown().await;
    browser.close();
    Ok(summary)
}

//! Browser collaborator for watch mode.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::server::ReloadState;

/// What the live loop needs from a browser session. Failures never
/// propagate; a browser that cannot be driven reports itself as gone.
pub trait Browser: Send + Sync {
    fn is_alive(&self) -> bool;
    fn refresh(&self);
    fn navigate_to(&self, url: &str);
    fn close(&self);
}

/// Used with `--no-browser`: always alive, does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBrowser;

impl Browser for NoBrowser {
    fn is_alive(&self) -> bool {
        true
    }
    fn refresh(&self) {}
    fn navigate_to(&self, _url: &str) {}
    fn close(&self) {}
}

/// The system browser, driven through the live-reload beacon. Refreshing
/// bumps the generation; liveness is inferred from the page's polling.
pub struct SystemBrowser {
    reload: Arc<ReloadState>,
    timeout: Duration,
    opened: Mutex<Option<Instant>>,
    failed: AtomicBool,
}

impl SystemBrowser {
    pub fn new(reload: Arc<ReloadState>, timeout: Duration) -> Self {
        Self {
            reload,
            timeout,
            opened: Mutex::new(None),
            failed: AtomicBool::new(false),
        }
    }

    fn opened_at(&self) -> Option<Instant> {
        self.opened.lock().ok().and_then(|o| *o)
    }
}

impl Browser for SystemBrowser {
    fn is_alive(&self) -> bool {
        if self.failed.load(Ordering::SeqCst) {
            return false;
        }
        let Some(opened) = self.opened_at() else {
            return true;
        };
        // A page that never polled gets the timeout counted from opening.
        match self.reload.since_heartbeat() {
            Some(idle) => idle < self.timeout,
            None => opened.elapsed() < self.timeout,
        }
    }

    fn refresh(&self) {
        let generation = self.reload.bump();
        debug!(generation, "browser refresh requested");
    }

    fn navigate_to(&self, url: &str) {
        match webbrowser::open(url) {
            Ok(()) => {
                info!(%url, "opened browser");
                if let Ok(mut opened) = self.opened.lock() {
                    *opened = Some(Instant::now());
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "could not open browser");
                self.failed.store(true, Ordering::SeqCst);
            }
        }
    }

    fn close(&self) {
        // The tab belongs to the user; it simply stops receiving reloads.
        if let Ok(mut opened) = self.opened.lock() {
            opened.take();
        }
    }
}

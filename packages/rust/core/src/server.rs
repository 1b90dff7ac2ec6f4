//! Local preview server for the served tree.
//!
//! Files come from `_display/`, falling back to `_build/` for assets the
//! compiler wrote next to the staged pages. One extra route exposes the build
//! generation that the injected live-reload script polls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use quire_shared::{ProjectLayout, QuireError, Result, html_name};

use crate::assembler::GENERATION_PATH;

// ---------------------------------------------------------------------------
// Reload state
// ---------------------------------------------------------------------------

/// Build generation shared between the build loop and open pages.
#[derive(Debug, Default)]
pub struct ReloadState {
    generation: AtomicU64,
    heartbeat: Mutex<Option<Instant>>,
}

impl ReloadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the generation; open pages reload on their next poll.
    pub fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Record a poll from an open page.
    pub fn touch(&self) {
        if let Ok(mut beat) = self.heartbeat.lock() {
            *beat = Some(Instant::now());
        }
    }

    /// Time since the last poll, `None` if no page ever polled.
    pub fn since_heartbeat(&self) -> Option<Duration> {
        self.heartbeat.lock().ok().and_then(|beat| beat.map(|t| t.elapsed()))
    }
}

async fn generation(State(reload): State<Arc<ReloadState>>) -> impl IntoResponse {
    reload.touch();
    (
        [(header::CACHE_CONTROL, "no-store")],
        reload.generation().to_string(),
    )
}

/// Routes for the preview: the generation endpoint plus static files.
pub fn router(layout: &ProjectLayout, reload: Arc<ReloadState>) -> Router {
    let files = ServeDir::new(&layout.display_dir).fallback(ServeDir::new(&layout.build_dir));
    Router::new()
        .route(GENERATION_PATH, get(generation))
        .fallback_service(files)
        .with_state(reload)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A running preview server.
pub struct PreviewServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PreviewServer {
    /// Bind `127.0.0.1:port` (0 picks a free port) and start serving.
    pub async fn start(layout: &ProjectLayout, port: u16, reload: Arc<ReloadState>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| QuireError::Server(format!("failed to bind port {port}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| QuireError::Server(e.to_string()))?;

        let app = router(layout, reload);
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = served.await {
                warn!(error = %e, "preview server stopped");
            }
        });

        info!("serving on http://localhost:{}", addr.port());
        Ok(Self {
            addr,
            shutdown: Some(tx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Browser URL of the page served for source `rel`.
    pub fn url_for(&self, rel: &str) -> String {
        format!("http://localhost:{}/{}", self.addr.port(), html_name(rel))
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "preview server task failed");
        }
        debug!("preview server shut down");
    }
}

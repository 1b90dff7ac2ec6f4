//! Filesystem watcher feeding rebuilds.
//!
//! notify events are pushed into an unbounded channel from the watcher's own
//! thread. Nothing is dropped while a build cycle is running: the events wait
//! in the channel and are folded into the next batch. A batch is released
//! once no relevant event has arrived for the debounce period.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use quire_shared::{ProjectLayout, QuireError, Result};

/// Whether a notify event can change a source. Removals count: the
/// includers of a deleted file and a deleted root's page must rebuild.
pub fn should_process_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Project-relative key of a path worth rebuilding for: a `.qmd` file
/// outside the generated trees.
pub fn relevant_key(layout: &ProjectLayout, path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("qmd") || path.is_dir() {
        return None;
    }
    if layout.is_generated(path) {
        return None;
    }
    layout.relative_key(path)
}

// ---------------------------------------------------------------------------
// Debounce
// ---------------------------------------------------------------------------

/// Accumulates changed paths until the quiet period has passed.
#[derive(Debug, Clone)]
pub struct ChangeBatcher {
    pending: BTreeSet<String>,
    last_event: Option<Instant>,
    debounce: Duration,
}

impl ChangeBatcher {
    pub fn new(debounce: Duration) -> Self {
        Self {
            pending: BTreeSet::new(),
            last_event: None,
            debounce,
        }
    }

    pub fn push(&mut self, key: String, now: Instant) {
        self.pending.insert(key);
        self.last_event = Some(now);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the current batch becomes ready, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        match self.last_event {
            Some(last) if !self.pending.is_empty() => Some(last + self.debounce),
            _ => None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }

    /// Hand out the batch and start a new one.
    pub fn take(&mut self) -> BTreeSet<String> {
        self.last_event = None;
        std::mem::take(&mut self.pending)
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Recursive watcher over the project root.
pub struct ProjectWatcher {
    _watcher: Option<RecommendedWatcher>,
    rx: UnboundedReceiver<notify::Result<Event>>,
    layout: ProjectLayout,
    batch: ChangeBatcher,
}

impl ProjectWatcher {
    /// Start watching `layout.root`.
    pub fn start(layout: &ProjectLayout, debounce: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| QuireError::Watch(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&layout.root, RecursiveMode::Recursive)
            .map_err(|e| QuireError::Watch(format!("failed to watch {}: {e}", layout.root.display())))?;
        info!(root = %layout.root.display(), "watching for changes");

        Ok(Self {
            _watcher: Some(watcher),
            rx,
            layout: layout.clone(),
            batch: ChangeBatcher::new(debounce),
        })
    }

    /// Watcher over an externally fed event channel.
    pub(crate) fn from_channel(
        layout: &ProjectLayout,
        rx: UnboundedReceiver<notify::Result<Event>>,
        debounce: Duration,
    ) -> Self {
        Self {
            _watcher: None,
            rx,
            layout: layout.clone(),
            batch: ChangeBatcher::new(debounce),
        }
    }

    /// Wait for the next debounced batch of changed sources. Returns `None`
    /// once the event source is gone.
    pub async fn next_batch(&mut self) -> Option<BTreeSet<String>> {
        loop {
            // Fold in everything queued so far, including events that arrived
            // while the caller was busy building.
            while let Ok(event) = self.rx.try_recv() {
                self.absorb(event);
            }
            if self.batch.is_ready(Instant::now()) {
                return Some(self.batch.take());
            }

            match self.batch.deadline() {
                Some(deadline) => {
                    tokio::select! {
                        event = self.rx.recv() => match event {
                            Some(event) => self.absorb(event),
                            None => return Some(self.batch.take()),
                        },
                        _ = tokio::time::sleep_until(deadline.into()) => {}
                    }
                }
                None => match self.rx.recv().await {
                    Some(event) => self.absorb(event),
                    None => return None,
                },
            }
        }
    }

    /// Stop watching. Queued events are discarded.
    pub fn stop(mut self) {
        self._watcher.take();
        self.rx.close();
        debug!("watcher stopped");
    }

    fn absorb(&mut self, event: notify::Result<Event>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "watch error");
                return;
            }
        };
        if !should_process_event(&event) {
            return;
        }
        let now = Instant::now();
        for path in &event.paths {
            if let Some(key) = relevant_key(&self.layout, path) {
                debug!(path = %key, "source changed");
                self.batch.push(key, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use std::path::PathBuf;

    fn temp_project() -> (PathBuf, ProjectLayout) {
        let dir = std::env::temp_dir().join(format!("quire-watcher-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let layout = ProjectLayout::new(&dir).unwrap();
        (dir, layout)
    }

    #[test]
    fn only_sources_outside_generated_trees_count() {
        let (dir, layout) = temp_project();
        assert_eq!(relevant_key(&layout, &layout.root.join("notes/a.qmd")).as_deref(), Some("notes/a.qmd"));
        assert!(relevant_key(&layout, &layout.build_dir.join("a.qmd")).is_none());
        assert!(relevant_key(&layout, &layout.display_dir.join("a.qmd")).is_none());
        assert!(relevant_key(&layout, &layout.root.join("a.html")).is_none());
        assert!(relevant_key(&layout, Path::new("/elsewhere/a.qmd")).is_none());

        let access = Event::new(EventKind::Access(AccessKind::Any));
        assert!(!should_process_event(&access));
        assert!(should_process_event(&Event::new(EventKind::Modify(ModifyKind::Any))));
        assert!(should_process_event(&Event::new(EventKind::Remove(RemoveKind::File))));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn batcher_waits_for_quiet_period() {
        let mut batch = ChangeBatcher::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(batch.deadline().is_none());

        batch.push("a.qmd".into(), t0);
        batch.push("b.qmd".into(), t0 + Duration::from_millis(60));
        assert!(!batch.is_ready(t0 + Duration::from_millis(120)));
        assert!(batch.is_ready(t0 + Duration::from_millis(160)));

        let taken = batch.take();
        assert_eq!(taken.len(), 2);
        assert!(batch.is_empty());
        assert!(batch.deadline().is_none());
    }

    #[tokio::test]
    async fn edits_queued_during_a_cycle_land_in_the_next_batch() {
        let (dir, layout) = temp_project();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = ProjectWatcher::from_channel(&layout, rx, Duration::from_millis(20));

        let modify = |rel: &str| Ok(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(layout.root.join(rel)));
        tx.send(modify("tasks.qmd")).unwrap();
        let first = watcher.next_batch().await.unwrap();
        assert_eq!(first, BTreeSet::from(["tasks.qmd".to_string()]));

        // Nobody polls while a cycle runs; these queue in the channel.
        tx.send(modify("index.qmd")).unwrap();
        tx.send(Ok(Event::new(EventKind::Create(CreateKind::File)).add_path(layout.build_dir.join("x.qmd"))))
            .unwrap();
        tx.send(modify("notes/day.qmd")).unwrap();

        let second = watcher.next_batch().await.unwrap();
        assert_eq!(
            second,
            BTreeSet::from(["index.qmd".to_string(), "notes/day.qmd".to_string()])
        );

        drop(tx);
        assert!(watcher.next_batch().await.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn deleted_sources_are_batched() {
        let (dir, layout) = temp_project();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = ProjectWatcher::from_channel(&layout, rx, Duration::from_millis(20));

        // The path no longer exists when the event is read.
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(layout.root.join("notes/old.qmd"));
        tx.send(Ok(removed)).unwrap();
        let batch = watcher.next_batch().await.unwrap();
        assert_eq!(batch, BTreeSet::from(["notes/old.qmd".to_string()]));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

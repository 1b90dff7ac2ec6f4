//! Concurrent, cached execution of notebook groups.
//!
//! Groups are launched as soon as staging discovers code and run on their
//! own bounded pool, independent of the compiler pool. Completion is posted
//! as a [`NotebookEvent`] to a single consumer; workers never touch pages.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use quire_shared::{CellRecord, CodeBlock, NotebookArtifact};
use quire_storage::NotebookCache;

use crate::kernel::{Kernel, execute_group};
use crate::segment::{NotebookGroup, segment};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// How a group finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Outputs were already cached.
    Cached,
    /// Executed and stored. `failed` is true when a cell raised.
    Executed { failed: bool },
    /// Executed but the artifact could not be stored.
    StoreFailed(String),
}

/// Posted once per launched group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookEvent {
    pub source: String,
    pub hash: String,
    pub outcome: GroupOutcome,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

type HashLocks = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Owns the notebook pool and the in-flight group tasks.
pub struct NotebookRunner {
    kernel: Arc<dyn Kernel>,
    cache: NotebookCache,
    project_root: PathBuf,
    semaphore: Arc<Semaphore>,
    locks: HashLocks,
    events: UnboundedSender<NotebookEvent>,
    tasks: JoinSet<()>,
}

impl NotebookRunner {
    pub fn new(
        kernel: Arc<dyn Kernel>,
        cache: NotebookCache,
        project_root: impl Into<PathBuf>,
        workers: usize,
        events: UnboundedSender<NotebookEvent>,
    ) -> Self {
        Self {
            kernel,
            cache,
            project_root: project_root.into(),
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            locks: Arc::new(Mutex::new(HashMap::new())),
            events,
            tasks: JoinSet::new(),
        }
    }

    pub fn cache(&self) -> &NotebookCache {
        &self.cache
    }

    /// Launched groups not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Collect finished group tasks without waiting.
    pub fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "notebook task failed");
            }
        }
    }

    /// Segment each table and launch every group. Returns the launched groups.
    #[instrument(skip_all, fields(sources = tables.len()))]
    pub fn launch(&mut self, tables: &BTreeMap<String, Vec<CodeBlock>>) -> Vec<NotebookGroup> {
        self.reap();
        let mut launched = Vec::new();
        for (source, blocks) in tables {
            for group in segment(blocks) {
                self.spawn_group(source, group.clone());
                launched.push(group);
            }
        }
        debug!(groups = launched.len(), "notebook groups launched");
        launched
    }

    fn spawn_group(&mut self, source: &str, group: NotebookGroup) {
        let kernel = self.kernel.clone();
        let cache = self.cache.clone();
        let semaphore = self.semaphore.clone();
        let lock = self.lock_for(&group.hash);
        let locks = self.locks.clone();
        let events = self.events.clone();
        let working_dir = self
            .project_root
            .join(source)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.project_root.clone());

        self.tasks.spawn(async move {
            // Same-hash groups queue here before taking a pool slot.
            let guard = lock.lock().await;
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => run_group(kernel, cache, working_dir, &group).await,
                Err(e) => GroupOutcome::StoreFailed(format!("notebook pool closed: {e}")),
            };
            drop(guard);
            release_lock(&locks, &group.hash, lock);
            let event = NotebookEvent {
                source: group.source.clone(),
                hash: group.hash.clone(),
                outcome,
            };
            if events.send(event).is_err() {
                debug!(hash = %group.hash, "notebook event dropped, receiver gone");
            }
        });
    }

    fn lock_for(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(hash.to_string()).or_default().clone()
    }

    /// Wait for every launched group.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "notebook task failed");
            }
        }
    }
}

/// Drop the map entry for `hash` once no other group holds or awaits it.
fn release_lock(locks: &HashLocks, hash: &str, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = match locks.lock() {
        Ok(locks) => locks,
        Err(poisoned) => poisoned.into_inner(),
    };
    // The map and this task are the only owners left. The task's handle is
    // released under the map lock so a racing group sees the final count.
    let last = Arc::strong_count(&lock) == 2;
    drop(lock);
    if last {
        locks.remove(hash);
    }
}

async fn run_group(
    kernel: Arc<dyn Kernel>,
    cache: NotebookCache,
    working_dir: PathBuf,
    group: &NotebookGroup,
) -> GroupOutcome {
    if cache.load(&group.hash).is_some() {
        info!(source = %group.source, hash = %group.hash, "reading cached notebook output");
        return GroupOutcome::Cached;
    }

    info!(
        source = %group.source,
        hash = %group.hash,
        "generating notebook ({}/{})",
        group.ordinal,
        group.total
    );
    let codes = group.codes();
    let label = group.source.clone();
    let executed = tokio::task::spawn_blocking(move || {
        let outputs = execute_group(kernel.as_ref(), &working_dir, &label, &codes);
        codes
            .into_iter()
            .zip(outputs)
            .map(|(code, outputs)| CellRecord { code, outputs })
            .collect::<Vec<_>>()
    })
    .await;

    let cells = match executed {
        Ok(cells) => cells,
        Err(e) => return GroupOutcome::StoreFailed(format!("notebook task failed: {e}")),
    };

    let artifact = NotebookArtifact::new(&group.hash, &group.source, cells);
    let failed = artifact.has_error();
    match cache.store(&artifact) {
        Ok(_) => GroupOutcome::Executed { failed },
        Err(e) => {
            warn!(hash = %group.hash, error = %e, "failed to store notebook artifact");
            GroupOutcome::StoreFailed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::ScriptedKernel;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    fn table(source: &str, codes: &[&str]) -> (String, Vec<CodeBlock>) {
        let blocks = codes
            .iter()
            .enumerate()
            .map(|(i, c)| CodeBlock::new(source, i + 1, *c))
            .collect();
        (source.to_string(), blocks)
    }

    fn setup(kernel: &ScriptedKernel) -> (PathBuf, NotebookRunner, mpsc::UnboundedReceiver<NotebookEvent>) {
        let dir = std::env::temp_dir().join(format!("quire-runner-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = NotebookRunner::new(
            Arc::new(kernel.clone()),
            NotebookCache::new(dir.join("_nbcache")),
            &dir,
            4,
            tx,
        );
        (dir, runner, rx)
    }

    #[tokio::test]
    async fn identical_code_executes_once() {
        let kernel = ScriptedKernel::default();
        let (dir, mut runner, mut rx) = setup(&kernel);

        let tables = BTreeMap::from([table("a.qmd", &["print(2+2)\n"]), table("b.qmd", &["print(2+2)\n"])]);
        let launched = runner.launch(&tables);
        assert_eq!(launched.len(), 2);
        runner.drain().await;

        let mut outcomes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            outcomes.push(event.outcome);
        }
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.contains(&GroupOutcome::Cached));
        assert!(outcomes.contains(&GroupOutcome::Executed { failed: false }));
        assert_eq!(kernel.log.starts.load(Ordering::SeqCst), 1);

        let artifact = runner.cache().load(&launched[0].hash).unwrap();
        assert_eq!(artifact.cells[0].outputs, vec![quire_shared::CellOutput::stdout("4\n")]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn second_launch_hits_cache() {
        let kernel = ScriptedKernel::default();
        let (dir, mut runner, mut rx) = setup(&kernel);
        let tables = BTreeMap::from([table("a.qmd", &["x = 1\n", "print(2+2)\n"])]);

        runner.launch(&tables);
        runner.drain().await;
        runner.launch(&tables);
        runner.drain().await;

        assert!(matches!(rx.try_recv().unwrap().outcome, GroupOutcome::Executed { .. }));
        assert_eq!(rx.try_recv().unwrap().outcome, GroupOutcome::Cached);
        assert_eq!(kernel.log.executed.lock().unwrap().len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failure_is_contained_to_its_group() {
        let kernel = ScriptedKernel::default();
        let (dir, mut runner, mut rx) = setup(&kernel);
        let tables = BTreeMap::from([table(
            "a.qmd",
            &["raise ValueError()\n", "y = 1\n", "%reset -f\nprint(2+2)\n"],
        )]);

        let groups = runner.launch(&tables);
        runner.drain().await;
        let mut failed = 0;
        while let Ok(event) = rx.try_recv() {
            if event.outcome == (GroupOutcome::Executed { failed: true }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);

        let first = runner.cache().load(&groups[0].hash).unwrap();
        assert!(first.cells[0].outputs[0].is_error());
        assert_eq!(first.cells[1].outputs, vec![quire_shared::CellOutput::previous_failed()]);
        let second = runner.cache().load(&groups[1].hash).unwrap();
        assert_eq!(second.cells[0].outputs, vec![quire_shared::CellOutput::stdout("4\n")]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn finished_groups_are_reaped_and_release_their_locks() {
        let kernel = ScriptedKernel::default();
        let (dir, mut runner, mut rx) = setup(&kernel);
        let sources: Vec<String> = (0..12).map(|i| format!("page{i}.qmd")).collect();
        let tables: BTreeMap<String, Vec<CodeBlock>> = sources
            .iter()
            .enumerate()
            .map(|(i, s)| table(s, &[if i % 2 == 0 { "print(2+2)\n" } else { "print(3+3)\n" }]))
            .collect();

        let launched = runner.launch(&tables);
        for _ in &launched {
            rx.recv().await.unwrap();
        }
        for _ in 0..100 {
            runner.reap();
            if runner.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(runner.in_flight(), 0);
        assert!(runner.locks.lock().unwrap().is_empty());

        // A later launch starts from a clean slate and reaps as it goes.
        runner.launch(&tables);
        for _ in &launched {
            assert_eq!(rx.recv().await.unwrap().outcome, GroupOutcome::Cached);
        }
        runner.drain().await;
        assert_eq!(runner.in_flight(), 0);
        assert!(runner.locks.lock().unwrap().is_empty());
        assert_eq!(kernel.log.starts.load(Ordering::SeqCst), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Bounded pool of compiler invocations.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use quire_shared::{QuireError, Result};

use crate::compiler::{CompileRequest, DocumentCompiler};

/// One target to compile.
#[derive(Debug, Clone)]
pub struct RenderJob {
    /// Project-relative source key, for logging.
    pub target: String,
    pub request: CompileRequest,
}

/// Runs compile jobs concurrently, at most `workers` at a time.
///
/// Jobs are independent: a target's compiled body never depends on the
/// compiled body of its includes, so no include ordering is enforced here.
#[derive(Clone)]
pub struct RenderExecutor {
    compiler: Arc<dyn DocumentCompiler>,
    workers: usize,
}

impl RenderExecutor {
    pub fn new(compiler: Arc<dyn DocumentCompiler>, workers: usize) -> Self {
        Self {
            compiler,
            workers: workers.max(1),
        }
    }

    /// Compile every job. All jobs are drained before the first failure is
    /// returned. Returns the compiled targets in submission order.
    #[instrument(skip_all, fields(jobs = jobs.len(), workers = self.workers))]
    pub async fn run(&self, jobs: Vec<RenderJob>) -> Result<Vec<String>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.workers.min(jobs.len())));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let sem = semaphore.clone();
            let compiler = self.compiler.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| QuireError::validation(format!("compiler pool closed: {e}")))?;

                info!(doc = %job.target, "compiling");
                let start = Instant::now();
                let target = job.target.clone();
                tokio::task::spawn_blocking(move || compiler.compile(&job.request))
                    .await
                    .map_err(|e| QuireError::validation(format!("compile task failed: {e}")))??;
                info!(
                    doc = %target,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "compiled"
                );
                Ok::<String, QuireError>(target)
            }));
        }

        let mut compiled = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| QuireError::validation(format!("compile task panicked: {e}")))
                .and_then(|r| r);
            match outcome {
                Ok(target) => compiled.push(target),
                Err(e) => {
                    warn!(error = %e, "compile failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(compiled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_shared::MathMode;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct SlowCompiler {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl DocumentCompiler for SlowCompiler {
        fn compile(&self, request: &CompileRequest) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.active.fetch_sub(1, Ordering::SeqCst);

            let name = request.source.display().to_string();
            self.calls.lock().unwrap().push(name.clone());
            if self.fail_on.as_deref() == Some(name.as_str()) {
                return Err(QuireError::Compiler {
                    diagnostics: "boom".into(),
                    invocation: format!("pandoc {name}"),
                });
            }
            Ok(())
        }
    }

    fn jobs(n: usize) -> Vec<RenderJob> {
        (0..n)
            .map(|i| RenderJob {
                target: format!("doc{i}.qmd"),
                request: CompileRequest {
                    source: PathBuf::from(format!("doc{i}.qmd")),
                    output: PathBuf::from(format!("doc{i}.html")),
                    fragment: false,
                    bibliography: None,
                    csl: None,
                    math: MathMode::WebTex,
                },
            })
            .collect()
    }

    #[tokio::test]
    async fn respects_worker_bound() {
        let compiler = Arc::new(SlowCompiler::default());
        let executor = RenderExecutor::new(compiler.clone(), 3);

        let compiled = executor.run(jobs(9)).await.unwrap();
        assert_eq!(compiled.len(), 9);
        assert_eq!(compiled[0], "doc0.qmd");
        assert!(compiler.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(compiler.calls.lock().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn failure_drains_then_reports() {
        let compiler = Arc::new(SlowCompiler {
            fail_on: Some("doc1.qmd".into()),
            ..Default::default()
        });
        let executor = RenderExecutor::new(compiler.clone(), 2);

        let err = executor.run(jobs(5)).await.unwrap_err();
        assert!(err.to_string().contains("when trying to run: pandoc doc1.qmd"));
        assert_eq!(compiler.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn empty_job_list_is_a_no_op() {
        let executor = RenderExecutor::new(Arc::new(SlowCompiler::default()), 4);
        assert!(executor.run(Vec::new()).await.unwrap().is_empty());
    }
}

//! Code kernel sessions.
//!
//! The production kernel is a Python subprocess running the bundled
//! JSON-lines bridge (`bridge/kernel_bridge.py`):
//!
//! ```text
//! → {"type":"execute","id":"req-1","code":"print(2+2)"}
//! ← {"type":"result","id":"req-1","outputs":[{"output_type":"stream",...}]}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, info, warn};

use quire_shared::{CellOutput, KernelConfig, QuireError, Result};

const BRIDGE_SCRIPT: &str = include_str!("../bridge/kernel_bridge.py");

// ---------------------------------------------------------------------------
// Kernel traits
// ---------------------------------------------------------------------------

/// Starts kernel sessions. Shared across notebook workers.
pub trait Kernel: Send + Sync {
    fn start(&self, working_dir: &Path) -> Result<Box<dyn KernelSession>>;
}

/// One live interpreter. Cells executed in the same session share state.
pub trait KernelSession: Send {
    /// Run one cell. `Err` means the session itself broke, not that the
    /// code raised (that is an `error` output).
    fn execute(&mut self, code: &str) -> Result<Vec<CellOutput>>;

    fn shutdown(self: Box<Self>);
}

/// Execute `cells` in a fresh session, one output list per cell.
///
/// The first failing cell keeps its error; every later cell gets the
/// "previous cell failed" marker instead of running.
pub fn execute_group(kernel: &dyn Kernel, working_dir: &Path, label: &str, cells: &[String]) -> Vec<Vec<CellOutput>> {
    let total = cells.len();
    let mut results: Vec<Vec<CellOutput>> = Vec::with_capacity(total);

    let mut session = match kernel.start(working_dir) {
        Ok(session) => session,
        Err(e) => {
            warn!(source = %label, error = %e, "kernel failed to start");
            return fail_from(0, total, &e);
        }
    };

    for (i, code) in cells.iter().enumerate() {
        info!(source = %label, "cell {}/{}", i + 1, total);
        match session.execute(code) {
            Ok(outputs) => {
                let failed = outputs.iter().any(CellOutput::is_error);
                results.push(outputs);
                if failed {
                    debug!(source = %label, cell = i + 1, "cell raised, skipping the rest of the group");
                    results.extend((i + 1..total).map(|_| vec![CellOutput::previous_failed()]));
                    break;
                }
            }
            Err(e) => {
                warn!(source = %label, cell = i + 1, error = %e, "kernel session failed");
                results.extend(fail_from(i, total, &e));
                break;
            }
        }
    }

    session.shutdown();
    results
}

fn fail_from(first: usize, total: usize, error: &QuireError) -> Vec<Vec<CellOutput>> {
    (first..total)
        .map(|i| {
            if i == first {
                vec![CellOutput::Error {
                    ename: "KernelError".into(),
                    evalue: error.to_string(),
                    traceback: vec![],
                }]
            } else {
                vec![CellOutput::previous_failed()]
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Bridge kernel
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage<'a> {
    #[serde(rename = "execute")]
    Execute { id: String, code: &'a str },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result {
        #[allow(dead_code)]
        id: String,
        outputs: Vec<CellOutput>,
    },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

/// Python kernel driven over stdin/stdout.
#[derive(Debug, Clone)]
pub struct BridgeKernel {
    program: String,
    args: Vec<String>,
}

impl BridgeKernel {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

impl Kernel for BridgeKernel {
    fn start(&self, working_dir: &Path) -> Result<Box<dyn KernelSession>> {
        debug!(program = %self.program, dir = %working_dir.display(), "starting kernel");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("-u")
            .arg("-c")
            .arg(BRIDGE_SCRIPT)
            .current_dir(working_dir)
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                QuireError::kernel(format!(
                    "failed to spawn kernel: {e}. Is `{}` installed?",
                    self.program
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| QuireError::kernel("failed to capture kernel stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| QuireError::kernel("failed to capture kernel stdout"))?;

        let mut session = BridgeSession {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };
        session.wait_for_ready()?;
        Ok(Box::new(session))
    }
}

struct BridgeSession {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeSession {
    fn read_message(&mut self) -> Result<ResponseMessage> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| QuireError::kernel(format!("kernel read error: {e}")))?;
        if line.is_empty() {
            return Err(QuireError::kernel("kernel closed stdout unexpectedly"));
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            QuireError::kernel(format!(
                "invalid kernel message: {e} (got: {})",
                line.chars().take(200).collect::<String>()
            ))
        })
    }

    fn wait_for_ready(&mut self) -> Result<()> {
        match self.read_message()? {
            ResponseMessage::Ready => Ok(()),
            other => Err(QuireError::kernel(format!("expected ready message, got: {other:?}"))),
        }
    }
}

impl KernelSession for BridgeSession {
    fn execute(&mut self, code: &str) -> Result<Vec<CellOutput>> {
        self.request_counter += 1;
        let request = RequestMessage::Execute {
            id: format!("req-{}", self.request_counter),
            code,
        };
        let json = serde_json::to_string(&request)
            .map_err(|e| QuireError::kernel(format!("failed to serialize request: {e}")))?;

        writeln!(self.stdin, "{json}")
            .and_then(|_| self.stdin.flush())
            .map_err(|e| QuireError::kernel(format!("failed to write to kernel stdin: {e}")))?;

        match self.read_message()? {
            ResponseMessage::Result { outputs, .. } => Ok(outputs),
            ResponseMessage::Error { error, .. } => Err(QuireError::kernel(error)),
            ResponseMessage::Ready => Err(QuireError::kernel("unexpected ready message during execution")),
        }
    }

    fn shutdown(mut self: Box<Self>) {
        if let Ok(json) = serde_json::to_string(&RequestMessage::Shutdown) {
            let _ = writeln!(self.stdin, "{json}");
            let _ = self.stdin.flush();
        }
        match self.child.wait() {
            Ok(status) => debug!(?status, "kernel exited"),
            Err(e) => warn!("kernel wait error: {e}"),
        }
    }
}

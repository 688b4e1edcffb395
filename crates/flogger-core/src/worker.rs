//! Worker processes for the process pool.
//!
//! The parent keeps the store and the entry locks; a worker process only runs
//! handlers. Each request is one JSON line on the worker's stdin, each response
//! one line on its stdout prefixed with [`RESPONSE_MARKER`]. Anything else a
//! handler prints on stdout is forwarded to the parent's stdout.
//!
//! Handlers cross the process boundary by name: a worker resolves them from its
//! own [`HandlerRegistry`], so custom handlers must be registered in the worker
//! binary under the same name as in the parent.
//!
//! ```no_run
//! use flogger_core::{worker, HandlerRegistry};
//!
//! fn main() {
//!     // Must run before anything else: in a worker this serves and exits.
//!     worker::run_if_worker(&HandlerRegistry::builtin());
//!     // ... the experiment ...
//! }
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{FloggerError, Result};
use crate::handlers::{run_handler, Handler, HandlerInvoker, HandlerOutcome, HandlerRegistry};
use crate::models::{Event, Series};

/// Environment variable that turns an executable into a worker.
pub const WORKER_ENV: &str = "FLOGGER_WORKER";

/// Prefix of protocol lines on a worker's stdout.
pub const RESPONSE_MARKER: &str = "\u{1e}flogger:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub entry: String,
    pub event: Event,
    pub path: PathBuf,
    pub handlers: Vec<String>,
    pub data: Series,
}

/// Borrowed form of [`WorkerRequest`], serialized without copying the data.
#[derive(Serialize)]
struct WorkerRequestRef<'a> {
    entry: &'a str,
    event: Event,
    path: &'a Path,
    handlers: Vec<&'a str>,
    data: &'a Series,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub outcomes: Vec<HandlerOutcome>,
}

// ─── Worker side ─────────────────────────────────────────────────────────────

/// Whether the current process was launched as a worker.
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// In a worker process, serve requests on stdin/stdout until EOF and exit.
/// Returns immediately in any other process.
pub fn run_if_worker(registry: &HandlerRegistry) {
    if !is_worker() {
        return;
    }
    let code = match serve(registry, io::stdin().lock(), io::stdout()) {
        Ok(served) => {
            debug!(served, "worker input closed");
            0
        }
        Err(e) => {
            error!("worker stopped: {e}");
            1
        }
    };
    std::process::exit(code);
}

/// Answer every request read from `input`. Returns the number served.
pub fn serve<R: BufRead, W: Write>(registry: &HandlerRegistry, input: R, mut output: W) -> Result<usize> {
    debug!(handlers = ?registry.names(), "worker serving");
    let mut served = 0;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = serde_json::from_str(&line)?;
        let response = handle_request(registry, &request);
        writeln!(output, "{RESPONSE_MARKER}{}", serde_json::to_string(&response)?)?;
        output.flush()?;
        served += 1;
    }
    Ok(served)
}

/// Run the requested handlers in order. Unknown names fail individually.
pub fn handle_request(registry: &HandlerRegistry, request: &WorkerRequest) -> WorkerResponse {
    let outcomes = request
        .handlers
        .iter()
        .map(|name| match registry.get(name) {
            Some(handler) => run_handler(&request.entry, handler, &request.data, &request.path),
            None => HandlerOutcome::failed(name, format!("handler `{name}` is not registered in this worker")),
        })
        .collect();
    WorkerResponse { outcomes }
}

// ─── Parent side ─────────────────────────────────────────────────────────────

/// How to launch a worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable, which must call [`run_if_worker`] first thing.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn spawn(&self) -> Result<WorkerProcess> {
        WorkerProcess::spawn(self)
    }
}

/// A live worker process, used as a [`HandlerInvoker`].
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    broken: bool,
}

impl WorkerProcess {
    fn spawn(command: &WorkerCommand) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FloggerError::Worker("worker stdin is not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FloggerError::Worker("worker stdout is not piped".into()))?;
        debug!(pid = child.id(), program = %command.program.display(), "worker process started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            broken: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// False once an exchange failed; such a worker must not be reused.
    pub fn is_healthy(&self) -> bool {
        !self.broken
    }

    fn exchange(&mut self, request: &WorkerRequestRef<'_>) -> Result<WorkerResponse> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| FloggerError::Worker("worker input is closed".into()))?;
        let line = serde_json::to_string(request)?;
        writeln!(stdin, "{line}")?;
        stdin.flush()?;

        let mut buf = String::new();
        loop {
            buf.clear();
            if self.stdout.read_line(&mut buf)? == 0 {
                return Err(FloggerError::Worker(format!(
                    "worker process {} exited before answering",
                    self.id()
                )));
            }
            let line = buf.trim_end_matches(&['\n', '\r'][..]);
            // Handler output without a trailing newline lands in front of the marker.
            match line.find(RESPONSE_MARKER) {
                Some(at) => {
                    let (output, payload) = line.split_at(at);
                    if !output.is_empty() {
                        println!("{output}");
                    }
                    return Ok(serde_json::from_str(&payload[RESPONSE_MARKER.len()..])?);
                }
                None => println!("{line}"),
            }
        }
    }
}

impl HandlerInvoker for WorkerProcess {
    fn invoke(
        &mut self,
        event: Event,
        entry: &str,
        handlers: &[Handler],
        data: &Series,
        path: &Path,
    ) -> Result<Vec<HandlerOutcome>> {
        let request = WorkerRequestRef {
            entry,
            event,
            path,
            handlers: handlers.iter().map(Handler::name).collect(),
            data,
        };
        match self.exchange(&request) {
            Ok(response) if response.outcomes.len() == handlers.len() => Ok(response.outcomes),
            Ok(response) => {
                self.broken = true;
                Err(FloggerError::Worker(format!(
                    "expected {} outcomes, got {}",
                    handlers.len(),
                    response.outcomes.len()
                )))
            }
            Err(e) => {
                self.broken = true;
                warn!(pid = self.id(), "dropping worker process: {e}");
                Err(e)
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Closing stdin ends the serve loop of a healthy worker.
        drop(self.stdin.take());
        if self.broken {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

//! Execution pools: where and whether units of work run.
//!
//! | pool      | runs on                          | store  |
//! |-----------|----------------------------------|--------|
//! | `sync`    | the caller's thread, inside submit | local  |
//! | `silent`  | nowhere                          | local  |
//! | `thread`  | a fixed-size set of threads      | shared |
//! | `process` | a fixed-size set of worker processes (handlers only) | shared |
//!
//! Background pools own a dedicated tokio runtime whose blocking pool is capped
//! at the configured parallelism. Every submission returns a [`PendingResult`]
//! that can be polled without blocking.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::error::{FloggerError, Result};
use crate::handlers::{Handler, HandlerInvoker, HandlerOutcome, InProcess};
use crate::models::{Event, PoolKind, Series};
use crate::store::Store;
use crate::task::{execute, ErrorCallback, Task};
use crate::worker::{self, WorkerCommand, WorkerProcess};

/// How long dropping a background pool waits for running work.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Pending results ─────────────────────────────────────────────────────────

/// Outcome of a completed unit of work.
pub type Outcome = std::result::Result<(), Arc<FloggerError>>;

struct Slot {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

/// Handle on the eventual completion of one unit of work.
#[derive(Clone)]
pub struct PendingResult {
    slot: Arc<Slot>,
}

impl PendingResult {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                outcome: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// An already completed handle.
    pub fn completed(outcome: Result<()>) -> Self {
        let pending = Self::new();
        pending.complete(outcome);
        pending
    }

    pub(crate) fn complete(&self, outcome: Result<()>) {
        let mut slot = self
            .slot
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome.map_err(Arc::new));
        }
        drop(slot);
        self.slot.done.notify_all();
    }

    /// Whether the work has finished, without blocking.
    pub fn is_ready(&self) -> bool {
        self.outcome().is_some()
    }

    /// `None` while the work is still running.
    pub fn outcome(&self) -> Option<Outcome> {
        self.slot
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block for at most `timeout`. Returns whether the work has finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self
            .slot
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while slot.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            slot = self
                .slot
                .done
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("outcome", &self.outcome())
            .finish()
    }
}

// ─── Pools ───────────────────────────────────────────────────────────────────

/// Uniform submit interface over the four execution policies.
pub trait Pool: Send + Sync {
    fn kind(&self) -> PoolKind;

    /// Schedule `task` against `store`. A failure of the task as a whole is
    /// passed to `on_error` and recorded in the returned handle; it is never
    /// returned to the submitter.
    fn submit(&self, store: &Store, task: Task, on_error: ErrorCallback) -> PendingResult;
}

/// Build the pool for `kind`. `worker` is only used by the process pool.
pub fn build_pool(kind: PoolKind, worker: Option<&Path>) -> Result<Box<dyn Pool>> {
    kind.validate()?;
    let pool: Box<dyn Pool> = match kind {
        PoolKind::Sync => Box::new(ImmediatePool),
        PoolKind::Silent => Box::new(SilentPool),
        PoolKind::Thread { workers } => Box::new(ThreadPool::new(workers)?),
        PoolKind::Process { workers } => {
            let command = match worker {
                Some(program) => WorkerCommand::new(program),
                None => WorkerCommand::current_exe()?,
            };
            Box::new(ProcessPool::new(workers, command)?)
        }
    };
    debug!(pool = %kind, "pool ready");
    Ok(pool)
}

fn reject(error: FloggerError, on_error: &ErrorCallback) -> PendingResult {
    on_error(&error);
    PendingResult::completed(Err(error))
}

fn store_mismatch(kind: PoolKind) -> FloggerError {
    FloggerError::configuration(format!("the {} pool needs a shared store", kind.label()))
}

/// Runs work right away on the caller's thread.
#[derive(Debug, Default)]
pub struct ImmediatePool;

impl Pool for ImmediatePool {
    fn kind(&self) -> PoolKind {
        PoolKind::Sync
    }

    fn submit(&self, store: &Store, task: Task, on_error: ErrorCallback) -> PendingResult {
        PendingResult::completed(execute(task, &**store, &mut InProcess, &on_error))
    }
}

/// Discards work. Used to switch logging off without touching call sites.
#[derive(Debug, Default)]
pub struct SilentPool;

impl Pool for SilentPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Silent
    }

    fn submit(&self, _store: &Store, _task: Task, _on_error: ErrorCallback) -> PendingResult {
        PendingResult::completed(Ok(()))
    }
}

fn background_runtime(workers: usize, thread_name: &str) -> Result<Runtime> {
    Ok(Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(workers)
        .thread_name(thread_name)
        .build()?)
}

fn shutdown_runtime(runtime: Runtime) {
    // Blocking on shutdown is not allowed from inside another runtime.
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    }
}

/// Runs work on a fixed-size pool of background threads.
pub struct ThreadPool {
    workers: usize,
    runtime: Option<Runtime>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Result<Self> {
        let runtime = background_runtime(workers, "flogger-worker")?;
        Ok(Self {
            workers,
            runtime: Some(runtime),
        })
    }
}

impl Pool for ThreadPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Thread {
            workers: self.workers,
        }
    }

    fn submit(&self, store: &Store, task: Task, on_error: ErrorCallback) -> PendingResult {
        let Some(store) = store.shared().cloned() else {
            return reject(store_mismatch(self.kind()), &on_error);
        };
        let Some(runtime) = &self.runtime else {
            return reject(FloggerError::Backend("thread pool is shut down".into()), &on_error);
        };
        let pending = PendingResult::new();
        let completion = pending.clone();
        runtime.spawn_blocking(move || {
            let outcome = execute(task, &store, &mut InProcess, &on_error);
            completion.complete(outcome);
        });
        pending
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            shutdown_runtime(runtime);
        }
    }
}

/// Idle worker processes, spawned on demand up to the pool size.
struct WorkerSet {
    command: WorkerCommand,
    idle: Mutex<Vec<WorkerProcess>>,
}

impl WorkerSet {
    fn checkout(&self) -> Result<WorkerProcess> {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match idle {
            Some(process) => Ok(process),
            None => self.command.spawn(),
        }
    }

    fn checkin(&self, process: WorkerProcess) {
        if process.is_healthy() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(process);
        }
    }
}

/// Stands in for a worker that could not be started, so the store side of a
/// unit of work still happens.
struct Unavailable(String);

impl HandlerInvoker for Unavailable {
    fn invoke(
        &mut self,
        _event: Event,
        _entry: &str,
        _handlers: &[Handler],
        _data: &Series,
        _path: &Path,
    ) -> Result<Vec<HandlerOutcome>> {
        Err(FloggerError::Backend(format!(
            "no worker process available: {}",
            self.0
        )))
    }
}

/// Runs handlers on a fixed-size pool of worker processes.
///
/// Locking and store mutation happen on a parent-side dispatcher thread that
/// holds the entry lock while its worker process runs the handlers.
pub struct ProcessPool {
    workers: usize,
    runtime: Option<Runtime>,
    processes: Arc<WorkerSet>,
}

impl ProcessPool {
    /// Start `workers` worker processes from `command`.
    pub fn new(workers: usize, command: WorkerCommand) -> Result<Self> {
        if worker::is_worker() {
            return Err(FloggerError::configuration(
                "a worker process cannot start its own process pool",
            ));
        }
        let processes = (0..workers)
            .map(|_| command.spawn())
            .collect::<Result<Vec<_>>>()?;
        info!(
            workers,
            program = %command.program().display(),
            "worker processes started"
        );
        let runtime = background_runtime(workers, "flogger-dispatch")?;
        Ok(Self {
            workers,
            runtime: Some(runtime),
            processes: Arc::new(WorkerSet {
                command,
                idle: Mutex::new(processes),
            }),
        })
    }
}

impl Pool for ProcessPool {
    fn kind(&self) -> PoolKind {
        PoolKind::Process {
            workers: self.workers,
        }
    }

    fn submit(&self, store: &Store, task: Task, on_error: ErrorCallback) -> PendingResult {
        let Some(store) = store.shared().cloned() else {
            return reject(store_mismatch(self.kind()), &on_error);
        };
        let Some(runtime) = &self.runtime else {
            return reject(FloggerError::Backend("process pool is shut down".into()), &on_error);
        };
        let pending = PendingResult::new();
        let completion = pending.clone();
        let processes = Arc::clone(&self.processes);
        runtime.spawn_blocking(move || {
            let outcome = match processes.checkout() {
                Ok(mut process) => {
                    let outcome = execute(task, &store, &mut process, &on_error);
                    processes.checkin(process);
                    outcome
                }
                Err(e) => execute(task, &store, &mut Unavailable(e.to_string()), &on_error),
            };
            completion.complete(outcome);
        });
        pending
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            shutdown_runtime(runtime);
        }
        // Dropping the idle processes closes their input and reaps them.
        self.processes
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerSet;
    use crate::models::Value;
    use crate::store::{EntryStore, LocalStore, SharedStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ignore_errors() -> ErrorCallback {
        Arc::new(|_: &FloggerError| {})
    }

    fn push(entry: &str, v: i64) -> Task {
        Task::Push {
            entry: entry.into(),
            value: Value::from(v),
            key: None,
        }
    }

    #[test]
    fn immediate_pool_completes_inside_submit() {
        let store = Store::Local(LocalStore::new());
        store.declare("loss", HandlerSet::default()).unwrap();
        let pending = ImmediatePool.submit(&store, push("loss", 1), ignore_errors());
        assert!(pending.is_ready());
        assert!(matches!(pending.outcome(), Some(Ok(()))));
        assert_eq!(store.counter("loss").unwrap(), 1);
    }

    #[test]
    fn immediate_pool_routes_unit_failure_to_callback() {
        let store = Store::Local(LocalStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let on_error: ErrorCallback = {
            let calls = calls.clone();
            Arc::new(move |_: &FloggerError| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let pending = ImmediatePool.submit(&store, push("ghost", 1), on_error);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let outcome = pending.outcome().unwrap();
        assert!(matches!(outcome.unwrap_err().as_ref(), FloggerError::UnknownEntry(_)));
    }

    #[test]
    fn silent_pool_never_runs_work() {
        let store = Store::Local(LocalStore::new());
        store.declare("loss", HandlerSet::default()).unwrap();
        let pending = SilentPool.submit(&store, push("loss", 1), ignore_errors());
        assert!(matches!(pending.outcome(), Some(Ok(()))));
        assert_eq!(store.counter("loss").unwrap(), 0);
    }

    #[test]
    fn thread_pool_rejects_local_store() {
        let pool = ThreadPool::new(2).unwrap();
        let store = Store::Local(LocalStore::new());
        let pending = pool.submit(&store, push("loss", 1), ignore_errors());
        let outcome = pending.outcome().unwrap();
        assert!(matches!(outcome.unwrap_err().as_ref(), FloggerError::Configuration(_)));
    }

    #[test]
    fn thread_pool_runs_in_background() {
        let pool = ThreadPool::new(3).unwrap();
        let shared = SharedStore::new();
        shared.declare("loss", HandlerSet::default()).unwrap();
        let store = Store::Shared(shared.clone());

        let pending: Vec<_> = (0..50)
            .map(|i| pool.submit(&store, push("loss", i), ignore_errors()))
            .collect();
        for p in &pending {
            assert!(p.wait_timeout(Duration::from_secs(10)));
        }
        assert_eq!(shared.counter("loss").unwrap(), 50);
        // Default keys are read under the lock, so none collide.
        assert_eq!(shared.snapshot("loss").unwrap().len(), 50);
    }

    #[test]
    fn wait_timeout_expires_on_unfinished_work() {
        let pending = PendingResult::new();
        assert!(!pending.wait_timeout(Duration::from_millis(10)));
        pending.complete(Ok(()));
        assert!(pending.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn first_completion_wins() {
        let pending = PendingResult::new();
        pending.complete(Ok(()));
        pending.complete(Err(FloggerError::Backend("late".into())));
        assert!(matches!(pending.outcome(), Some(Ok(()))));
    }
}

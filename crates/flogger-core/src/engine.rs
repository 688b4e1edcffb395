//! The logger facade: the heart of flogger.
//!
//! `DataLogger` owns an entry store and the pool that runs work against it.
//! `push()`, `dump()` and `reset()` hand a [`Task`] to the pool and keep the
//! returned [`PendingResult`]; with a background pool they never block the
//! experiment. `wait()` is the only blocking call, and it blocks in slices of
//! at most one poll interval.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{FloggerError, Result};
use crate::handlers::{Handler, HandlerSet};
use crate::models::{Key, LoggerConfig, PoolKind, Series, Value};
use crate::pool::{build_pool, ImmediatePool, PendingResult, Pool};
use crate::storage;
use crate::store::Store;
use crate::task::{ErrorCallback, Task};

/// Default upper bound on a single sleep of [`DataLogger::wait`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long dropping a logger waits for outstanding work.
pub const DROP_WAIT: Duration = Duration::from_secs(5);

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Caller-owned data logger.
///
/// Configuration (`set_*`) takes `&mut self` and is only legal before the
/// first entry is declared. Everything else takes `&self`.
pub struct DataLogger {
    store: Store,
    pool: Box<dyn Pool>,
    pool_kind: PoolKind,
    worker_program: Option<PathBuf>,
    pending: Mutex<Vec<PendingResult>>,
    last_wait: Mutex<Instant>,
    poll_interval: Duration,
    on_error: ErrorCallback,
}

impl DataLogger {
    /// A logger named "data-logger", rooted at ".", running handlers inline.
    pub fn new() -> Self {
        Self {
            store: Store::for_pool(PoolKind::Sync),
            pool: Box::new(ImmediatePool),
            pool_kind: PoolKind::Sync,
            worker_program: None,
            pending: Mutex::new(Vec::new()),
            last_wait: Mutex::new(Instant::now()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            on_error: default_error_callback(),
        }
    }

    /// Build a configured logger in one step.
    pub fn from_config(config: LoggerConfig) -> Result<Self> {
        let mut logger = Self::new();
        logger.poll_interval = config.poll_interval();
        logger.worker_program = config.worker_program;
        logger.set_pool(config.pool)?;
        logger.set_name(&config.name)?;
        logger.set_path(&config.path)?;
        info!(
            logger = %config.name,
            pool = %config.pool,
            path = %config.path.display(),
            "DataLogger initialized"
        );
        Ok(logger)
    }

    // ─── Configuration ───────────────────────────────────────────────────────

    fn ensure_unconfigured(&self, what: &str) -> Result<()> {
        if self.store.is_empty() {
            Ok(())
        } else {
            Err(FloggerError::configuration(format!(
                "cannot change the {what} after entries have been declared"
            )))
        }
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.store.set_name(name)
    }

    /// Set the root directory handed to handlers, creating it if needed.
    pub fn set_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.ensure_unconfigured("logger path")?;
        storage::ensure_dir(path)?;
        self.store.set_path(path)
    }

    /// Switch executor. The store is replaced by the variant the pool needs;
    /// name and path carry over.
    pub fn set_pool(&mut self, kind: PoolKind) -> Result<()> {
        self.ensure_unconfigured("pool")?;
        let pool = build_pool(kind, self.worker_program.as_deref())?;
        let store = Store::for_pool(kind);
        store.set_name(&self.store.name())?;
        store.set_path(&self.store.path())?;

        // The old pool is dropped here, after the new one is ready.
        self.pool = pool;
        self.store = store;
        self.pool_kind = kind;
        lock_or_recover(&self.pending).clear();
        debug!(logger = %self.store.name(), pool = %kind, "pool switched");
        Ok(())
    }

    /// Executable launched by the process pool. Restarts the worker processes
    /// of a running process pool.
    pub fn set_worker_program(&mut self, program: impl Into<PathBuf>) -> Result<()> {
        self.ensure_unconfigured("worker program")?;
        self.worker_program = Some(program.into());
        if matches!(self.pool_kind, PoolKind::Process { .. }) {
            self.set_pool(self.pool_kind)?;
        }
        Ok(())
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval.max(Duration::from_millis(1));
    }

    /// Replace the callback receiving failures of whole units of work.
    /// The default logs them at error level.
    pub fn set_error_callback(&mut self, callback: impl Fn(&FloggerError) + Send + Sync + 'static) {
        self.on_error = Arc::new(callback);
    }

    // ─── Entries ─────────────────────────────────────────────────────────────

    /// Register `entry` with its three handler lists.
    pub fn declare(
        &self,
        entry: &str,
        on_push: Vec<Handler>,
        on_dump: Vec<Handler>,
        on_reset: Vec<Handler>,
    ) -> Result<()> {
        self.store
            .declare(entry, HandlerSet::new(on_push, on_dump, on_reset))?;
        debug!(logger = %self.store.name(), entry, "entry declared");
        Ok(())
    }

    /// Record `value` at `key`, or at the entry's push counter when `key` is
    /// `None`, then run the push handlers.
    ///
    /// A push handler may push to its own entry. Under the sync pool the
    /// nested push runs inline on the same thread, which already holds the
    /// entry lock and re-enters it.
    pub fn push(&self, entry: &str, value: impl Into<Value>, key: Option<Key>) -> Result<PendingResult> {
        self.ensure_declared(entry)?;
        Ok(self.submit(Task::Push {
            entry: entry.to_string(),
            value: value.into(),
            key,
        }))
    }

    /// Run the dump handlers of every entry.
    pub fn dump(&self) -> Vec<PendingResult> {
        self.store
            .entries()
            .into_iter()
            .map(|entry| self.submit(Task::Dump { entry }))
            .collect()
    }

    /// Run the reset handlers of `entry` on its current data, then clear it.
    pub fn reset(&self, entry: &str) -> Result<PendingResult> {
        self.ensure_declared(entry)?;
        Ok(self.submit(Task::Reset {
            entry: entry.to_string(),
        }))
    }

    fn ensure_declared(&self, entry: &str) -> Result<()> {
        if self.store.has_entry(entry) {
            Ok(())
        } else {
            Err(FloggerError::UnknownEntry(entry.to_string()))
        }
    }

    fn submit(&self, task: Task) -> PendingResult {
        let handle = self.pool.submit(&self.store, task, Arc::clone(&self.on_error));
        if !handle.is_ready() {
            let mut pending = lock_or_recover(&self.pending);
            pending.retain(|p| !p.is_ready());
            pending.push(handle.clone());
        }
        handle
    }

    // ─── Wait barrier ────────────────────────────────────────────────────────

    /// Block until every submitted unit of work has completed.
    pub fn wait(&self, log_durations: bool) {
        self.wait_until(None, log_durations);
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns whether
    /// all work completed.
    pub fn wait_timeout(&self, timeout: Duration, log_durations: bool) -> bool {
        self.wait_until(Some(Instant::now() + timeout), log_durations)
    }

    fn wait_until(&self, deadline: Option<Instant>, log_durations: bool) -> bool {
        let started = Instant::now();
        let name = self.store.name();
        if log_durations {
            let since = lock_or_recover(&self.last_wait).elapsed();
            info!(logger = %name, "{name} DataLogger: Last wait occurred {since:?} ago.");
        }

        let done = loop {
            let next = {
                let mut pending = lock_or_recover(&self.pending);
                pending.retain(|p| !p.is_ready());
                pending.first().cloned()
            };
            let Some(next) = next else {
                break true;
            };
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break false;
                    }
                    remaining.min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            next.wait_timeout(slice);
        };

        *lock_or_recover(&self.last_wait) = Instant::now();
        if log_durations {
            let waited = started.elapsed();
            info!(logger = %name, "{name} DataLogger: Waited {waited:?} for completion.");
        }
        done
    }

    /// Number of submitted units of work still running.
    pub fn pending(&self) -> usize {
        let mut pending = lock_or_recover(&self.pending);
        pending.retain(|p| !p.is_ready());
        pending.len()
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    /// Pushes recorded since declaration or the last reset. Overwrites count.
    pub fn entry_length(&self, entry: &str) -> Result<u64> {
        self.store.counter(entry)
    }

    /// Recorded values in ascending key order.
    pub fn series(&self, entry: &str) -> Result<Vec<Value>> {
        Ok(self.store.snapshot(entry)?.into_values().collect())
    }

    /// Recorded `(key, value)` pairs.
    pub fn snapshot(&self, entry: &str) -> Result<Series> {
        self.store.snapshot(entry)
    }

    /// Declared entries, in declaration order.
    pub fn entries(&self) -> Vec<String> {
        self.store.entries()
    }

    pub fn name(&self) -> String {
        self.store.name()
    }

    pub fn path(&self) -> PathBuf {
        self.store.path()
    }

    pub fn pool_kind(&self) -> PoolKind {
        self.pool_kind
    }
}

impl Default for DataLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DataLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLogger")
            .field("store", &self.store)
            .field("pool", &self.pool_kind)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for DataLogger {
    fn drop(&mut self) {
        // Best-effort drain; the pool's own drop then shuts it down.
        if !self.wait_timeout(DROP_WAIT, false) {
            error!(
                logger = %self.store.name(),
                pending = self.pending(),
                "DataLogger dropped with work still running"
            );
        }
    }
}

fn default_error_callback() -> ErrorCallback {
    Arc::new(|e: &FloggerError| error!("{e}"))
}

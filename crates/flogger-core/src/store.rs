//! Entry store: per-entry data, push counters, handler lists and locks.
//!
//! Two variants share the [`EntryStore`] contract:
//!
//! - [`LocalStore`] is owned by the logger and used in place by the inline pools.
//! - [`SharedStore`] is a cheap cloneable handle. Every clone observes the same
//!   entries, and each entry's lock, data, counter and handler lists live behind
//!   their own reference count so that a unit of work running on another thread
//!   (or dispatching to another process) holds only the entry it works on.
//!
//! Mutation of an entry's data only happens through an [`EntryLock`], which
//! makes "append and clear while holding the entry lock" a type-level rule.
//! There is no global lock: operations on different entries never contend
//! beyond the brief registry lookup.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use crate::error::{FloggerError, Result};
use crate::handlers::{Handler, HandlerSet};
use crate::models::{Event, Key, PoolKind, Series, Value};
use crate::storage;

pub const DEFAULT_NAME: &str = "data-logger";

/// Capability interface of an entry store.
pub trait EntryStore: Send + Sync {
    fn variant(&self) -> StoreVariant;

    fn name(&self) -> String;

    /// Fails once any entry exists.
    fn set_name(&self, name: &str) -> Result<()>;

    fn path(&self) -> PathBuf;

    /// Fails once any entry exists. Does not touch the file system.
    fn set_path(&self, path: &Path) -> Result<()>;

    /// Register a new entry with empty data, a zero counter and a fresh lock.
    /// If the name encodes a subdirectory it is created under the root path.
    fn declare(&self, entry: &str, handlers: HandlerSet) -> Result<()>;

    fn has_entry(&self, entry: &str) -> bool;

    /// Entry names in declaration order.
    fn entries(&self) -> Vec<String>;

    fn is_empty(&self) -> bool;

    /// Block until exclusive access to `entry` is granted.
    fn lock(&self, entry: &str) -> Result<EntryLock>;

    /// Number of pushes since declaration or the last clear.
    fn counter(&self, entry: &str) -> Result<u64>;

    /// Copy of the entry's current data.
    fn snapshot(&self, entry: &str) -> Result<Series>;

    fn handlers(&self, entry: &str, event: Event) -> Result<Vec<Handler>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVariant {
    Local,
    Shared,
}

impl fmt::Display for StoreVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreVariant::Local => write!(f, "local"),
            StoreVariant::Shared => write!(f, "shared"),
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Entries ─────────────────────────────────────────────────────────────────

/// Thread currently holding an entry, and how many guards it holds.
type Holder = Option<(ThreadId, usize)>;

struct EntryCell {
    name: String,
    holder: Mutex<Holder>,
    released: Condvar,
    data: RwLock<Series>,
    counter: AtomicU64,
    handlers: HandlerSet,
}

impl EntryCell {
    fn new(name: &str, handlers: HandlerSet) -> Self {
        Self {
            name: name.to_string(),
            holder: Mutex::new(None),
            released: Condvar::new(),
            data: RwLock::new(Series::new()),
            counter: AtomicU64::new(0),
            handlers,
        }
    }

    fn snapshot(&self) -> Series {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-entrant per thread: a handler running inline may lock its own entry
    /// again (for instance by pushing to it) without deadlocking.
    fn acquire(self: &Arc<Self>) -> EntryLock {
        let me = thread::current().id();
        let mut holder = lock_or_recover(&self.holder);
        loop {
            match *holder {
                None => {
                    *holder = Some((me, 1));
                    break;
                }
                Some((owner, ref mut depth)) if owner == me => {
                    *depth += 1;
                    break;
                }
                Some(_) => {}
            }
            holder = self
                .released
                .wait(holder)
                .unwrap_or_else(PoisonError::into_inner);
        }
        EntryLock {
            cell: Arc::clone(self),
        }
    }
}

/// Exclusive access to one entry for the current thread. Released when the
/// last guard of that thread is dropped.
pub struct EntryLock {
    cell: Arc<EntryCell>,
}

impl EntryLock {
    /// Insert or overwrite `data[key]`. The counter is incremented even on
    /// overwrite: it counts pushes, not distinct keys.
    pub fn append(&mut self, key: Key, value: Value) {
        self.cell
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
        self.cell.counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Empty the data and reset the counter.
    pub fn clear(&mut self) {
        *self
            .cell
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Series::new();
        self.cell.counter.store(0, Ordering::SeqCst);
    }

    pub fn counter(&self) -> u64 {
        self.cell.counter.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Series {
        self.cell.snapshot()
    }

    pub fn handlers(&self, event: Event) -> &[Handler] {
        self.cell.handlers.for_event(event)
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let mut holder = lock_or_recover(&self.cell.holder);
        if let Some((_, depth)) = holder.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *holder = None;
                drop(holder);
                self.cell.released.notify_one();
            }
        }
    }
}

impl fmt::Debug for EntryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryLock").field("entry", &self.cell.name).finish()
    }
}

// ─── Entry table (shared by both variants) ──────────────────────────────────

#[derive(Default)]
struct Registry {
    order: Vec<String>,
    cells: HashMap<String, Arc<EntryCell>>,
}

struct EntryTable {
    name: RwLock<String>,
    path: RwLock<PathBuf>,
    registry: RwLock<Registry>,
}

impl EntryTable {
    fn new() -> Self {
        Self {
            name: RwLock::new(DEFAULT_NAME.to_string()),
            path: RwLock::new(PathBuf::from(".")),
            registry: RwLock::new(Registry::default()),
        }
    }

    fn cell(&self, entry: &str) -> Result<Arc<EntryCell>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cells
            .get(entry)
            .cloned()
            .ok_or_else(|| FloggerError::UnknownEntry(entry.to_string()))
    }

    fn ensure_unfrozen(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FloggerError::configuration(format!(
                "cannot change the {what} after entries have been declared"
            )))
        }
    }

    fn name(&self) -> String {
        self.name.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_name(&self, name: &str) -> Result<()> {
        self.ensure_unfrozen("logger name")?;
        *self.name.write().unwrap_or_else(PoisonError::into_inner) = name.to_string();
        Ok(())
    }

    fn path(&self) -> PathBuf {
        self.path.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_path(&self, path: &Path) -> Result<()> {
        self.ensure_unfrozen("logger path")?;
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = path.to_path_buf();
        Ok(())
    }

    fn declare(&self, entry: &str, handlers: HandlerSet) -> Result<()> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.cells.contains_key(entry) {
            return Err(FloggerError::DuplicateEntry(entry.to_string()));
        }
        storage::ensure_entry_dir(&self.path(), entry)?;
        registry
            .cells
            .insert(entry.to_string(), Arc::new(EntryCell::new(entry, handlers)));
        registry.order.push(entry.to_string());
        Ok(())
    }

    fn has_entry(&self, entry: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cells
            .contains_key(entry)
    }

    fn entries(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    fn is_empty(&self) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .is_empty()
    }

    fn lock(&self, entry: &str) -> Result<EntryLock> {
        // The registry read lock is released before blocking on the entry.
        let cell = self.cell(entry)?;
        Ok(cell.acquire())
    }

    fn counter(&self, entry: &str) -> Result<u64> {
        Ok(self.cell(entry)?.counter.load(Ordering::SeqCst))
    }

    fn snapshot(&self, entry: &str) -> Result<Series> {
        Ok(self.cell(entry)?.snapshot())
    }

    fn handlers(&self, entry: &str, event: Event) -> Result<Vec<Handler>> {
        Ok(self.cell(entry)?.handlers.for_event(event).to_vec())
    }
}

macro_rules! delegate_entry_store {
    ($ty:ty, $variant:expr) => {
        impl EntryStore for $ty {
            fn variant(&self) -> StoreVariant {
                $variant
            }
            fn name(&self) -> String {
                self.table.name()
            }
            fn set_name(&self, name: &str) -> Result<()> {
                self.table.set_name(name)
            }
            fn path(&self) -> PathBuf {
                self.table.path()
            }
            fn set_path(&self, path: &Path) -> Result<()> {
                self.table.set_path(path)
            }
            fn declare(&self, entry: &str, handlers: HandlerSet) -> Result<()> {
                self.table.declare(entry, handlers)
            }
            fn has_entry(&self, entry: &str) -> bool {
                self.table.has_entry(entry)
            }
            fn entries(&self) -> Vec<String> {
                self.table.entries()
            }
            fn is_empty(&self) -> bool {
                self.table.is_empty()
            }
            fn lock(&self, entry: &str) -> Result<EntryLock> {
                self.table.lock(entry)
            }
            fn counter(&self, entry: &str) -> Result<u64> {
                self.table.counter(entry)
            }
            fn snapshot(&self, entry: &str) -> Result<Series> {
                self.table.snapshot(entry)
            }
            fn handlers(&self, entry: &str, event: Event) -> Result<Vec<Handler>> {
                self.table.handlers(entry, event)
            }
        }
    };
}

// ─── Variants ────────────────────────────────────────────────────────────────

/// Store owned by a single logger, used in place by the inline pools.
pub struct LocalStore {
    table: EntryTable,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            table: EntryTable::new(),
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

delegate_entry_store!(LocalStore, StoreVariant::Local);

/// Store handle that can be cloned into background workers.
#[derive(Clone)]
pub struct SharedStore {
    table: Arc<EntryTable>,
}

impl SharedStore {
    pub fn new() -> Self {
        Self {
            table: Arc::new(EntryTable::new()),
        }
    }
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

delegate_entry_store!(SharedStore, StoreVariant::Shared);

/// The store a logger owns, matching its pool.
pub enum Store {
    Local(LocalStore),
    Shared(SharedStore),
}

impl Store {
    /// Local store for inline pools, shared store for background pools.
    pub fn for_pool(pool: PoolKind) -> Self {
        if pool.needs_shared_store() {
            Store::Shared(SharedStore::new())
        } else {
            Store::Local(LocalStore::new())
        }
    }

    pub fn shared(&self) -> Option<&SharedStore> {
        match self {
            Store::Shared(store) => Some(store),
            Store::Local(_) => None,
        }
    }
}

impl Deref for Store {
    type Target = dyn EntryStore;

    fn deref(&self) -> &Self::Target {
        match self {
            Store::Local(store) => store as &dyn EntryStore,
            Store::Shared(store) => store as &dyn EntryStore,
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("variant", &self.variant())
            .field("name", &self.name())
            .field("path", &self.path())
            .field("entries", &self.entries())
            .finish()
    }
}

//! flogger-core: entry store, execution pools and logger facade for flogger.
//!
//! The central design principle: `push()` hands a unit of work to a pool and
//! returns, never blocking the experiment unless the pool runs inline. Every
//! unit of work holds the lock of its entry from mutation to the last handler
//! call, and `wait()` is the only place the caller blocks.

pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pool;
pub mod storage;
pub mod store;
pub mod task;
pub mod worker;

pub use engine::DataLogger;
pub use error::{FloggerError, Result};
pub use handlers::{Handler, HandlerOutcome, HandlerRegistry, HandlerSet};
pub use models::{Event, Key, LoggerConfig, PoolKind, Series, Value, DEFAULT_PARALLELISM};
pub use pool::{PendingResult, Pool};
pub use store::{EntryLock, EntryStore, LocalStore, SharedStore, Store};
pub use task::{Task, TaskReport};

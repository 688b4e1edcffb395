//! Handlers: caller-supplied functions invoked on push, dump and reset.
//!
//! A handler receives the entry name, the full current data of the entry and
//! the logger's root path. Handlers are named so that a worker process can
//! resolve the same function from its own [`HandlerRegistry`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Event, Key, Series, Value};
use crate::storage;

/// Signature shared by every handler: entry name, data, logger path.
///
/// Handlers run while their entry is locked. A handler may still push to its
/// own entry; the lock is re-entrant for the thread running it.
pub type HandlerFn = dyn Fn(&str, &Series, &Path) -> anyhow::Result<()> + Send + Sync;

/// A named handler. Cloning shares the underlying function.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    func: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str, &Series, &Path) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, entry: &str, data: &Series, path: &Path) -> anyhow::Result<()> {
        (self.func)(entry, data, path)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.name).finish()
    }
}

/// The three ordered handler lists of an entry.
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    pub on_push: Vec<Handler>,
    pub on_dump: Vec<Handler>,
    pub on_reset: Vec<Handler>,
}

impl HandlerSet {
    pub fn new(on_push: Vec<Handler>, on_dump: Vec<Handler>, on_reset: Vec<Handler>) -> Self {
        Self {
            on_push,
            on_dump,
            on_reset,
        }
    }

    pub fn for_event(&self, event: Event) -> &[Handler] {
        match event {
            Event::Push => &self.on_push,
            Event::Dump => &self.on_dump,
            Event::Reset => &self.on_reset,
        }
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub handler: String,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn ok(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            error: None,
        }
    }

    pub fn failed(handler: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            error: Some(cause.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs an ordered list of handlers against a snapshot.
///
/// `Err` means the invocation as a whole could not happen (e.g. the worker
/// process is gone); individual handler failures are reported as outcomes.
pub trait HandlerInvoker {
    fn invoke(
        &mut self,
        event: Event,
        entry: &str,
        handlers: &[Handler],
        data: &Series,
        path: &Path,
    ) -> Result<Vec<HandlerOutcome>>;
}

/// Calls handlers on the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcess;

impl HandlerInvoker for InProcess {
    fn invoke(
        &mut self,
        _event: Event,
        entry: &str,
        handlers: &[Handler],
        data: &Series,
        path: &Path,
    ) -> Result<Vec<HandlerOutcome>> {
        Ok(run_handlers(entry, handlers, data, path))
    }
}

/// Call every handler in order. Errors and panics are captured per handler and
/// never stop the remaining ones.
pub fn run_handlers(
    entry: &str,
    handlers: &[Handler],
    data: &Series,
    path: &Path,
) -> Vec<HandlerOutcome> {
    handlers
        .iter()
        .map(|handler| run_handler(entry, handler, data, path))
        .collect()
}

pub fn run_handler(entry: &str, handler: &Handler, data: &Series, path: &Path) -> HandlerOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.call(entry, data, path))) {
        Ok(Ok(())) => HandlerOutcome::ok(handler.name()),
        Ok(Err(e)) => HandlerOutcome::failed(handler.name(), format!("{e:#}")),
        Err(payload) => HandlerOutcome::failed(handler.name(), panic_message(payload.as_ref())),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Handlers addressable by name, used by worker processes.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in handler.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for handler in [
            echo_last(),
            echo_last_stderr(),
            log_debug_last(),
            log_info_last(),
            log_warning_last(),
            log_error_last(),
            save_to_json(),
            save_to_json_last(),
            save_to_text(),
            save_to_text_last(),
        ] {
            registry.register(handler);
        }
        registry
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, handler: Handler) -> &mut Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    pub fn with(mut self, handler: Handler) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ─── Built-in handlers ───────────────────────────────────────────────────────

fn last_item<'a>(entry: &str, data: &'a Series) -> anyhow::Result<(&'a Key, &'a Value)> {
    data.iter()
        .next_back()
        .ok_or_else(|| anyhow!("no data recorded for {entry}"))
}

/// Print `"<entry> at <key>: <value>"` for the last data point to stdout.
pub fn echo_last() -> Handler {
    Handler::new("echo_last", |entry, data, _path| {
        let (key, value) = last_item(entry, data)?;
        println!("{entry} at {key}: {value}");
        Ok(())
    })
}

/// Same as [`echo_last`], on stderr.
pub fn echo_last_stderr() -> Handler {
    Handler::new("echo_last_stderr", |entry, data, _path| {
        let (key, value) = last_item(entry, data)?;
        eprintln!("{entry} at {key}: {value}");
        Ok(())
    })
}

pub fn log_debug_last() -> Handler {
    Handler::new("log_debug_last", |entry, data, _path| {
        let (key, value) = last_item(entry, data)?;
        tracing::debug!(target: "datalogger", "{entry} at {key}: {value}");
        Ok(())
    })
}

pub fn log_info_last() -> Handler {
    Handler::new("log_info_last", |entry, data, _path| {
        let (key, value) = last_item(entry, data)?;
        tracing::info!(target: "datalogger", "{entry} at {key}: {value}");
        Ok(())
    })
}

pub fn log_warning_last() -> Handler {
    Handler::new("log_warning_last", |entry, data, _path| {
        let (key, value) = last_item(entry, data)?;
        tracing::warn!(target: "datalogger", "{entry} at {key}: {value}");
        Ok(())
    })
}

pub fn log_error_last() -> Handler {
    Handler::new("log_error_last", |entry, data, _path| {
        let (key, value) = last_item(entry, data)?;
        tracing::error!(target: "datalogger", "{entry} at {key}: {value}");
        Ok(())
    })
}

/// Write the whole series as a JSON object to `<path>/<entry>.json`.
pub fn save_to_json() -> Handler {
    Handler::new("save_to_json", |entry, data, path| {
        storage::write_json(&storage::entry_file(path, entry, "json"), data)?;
        Ok(())
    })
}

/// Write the last value as JSON to `<path>/<entry>.json`.
pub fn save_to_json_last() -> Handler {
    Handler::new("save_to_json_last", |entry, data, path| {
        let (_, value) = last_item(entry, data)?;
        storage::write_json(&storage::entry_file(path, entry, "json"), value)?;
        Ok(())
    })
}

/// Write one `key: value` line per data point to `<path>/<entry>.txt`.
pub fn save_to_text() -> Handler {
    Handler::new("save_to_text", |entry, data, path| {
        let content: String = data
            .iter()
            .map(|(key, value)| format!("{key}: {value}\n"))
            .collect();
        storage::write_text(&storage::entry_file(path, entry, "txt"), &content)?;
        Ok(())
    })
}

/// Write the last value to `<path>/<entry>.txt`.
pub fn save_to_text_last() -> Handler {
    Handler::new("save_to_text_last", |entry, data, path| {
        let (_, value) = last_item(entry, data)?;
        storage::write_text(&storage::entry_file(path, entry, "txt"), &value.to_string())?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn series(values: &[(Key, f64)]) -> Series {
        values.iter().map(|(k, v)| (*k, Value::from(*v))).collect()
    }

    #[test]
    fn failures_and_panics_do_not_stop_later_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = calls.clone();
            Handler::new("counted", move |_, _, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let handlers = vec![
            Handler::new("fails", |_, _, _| Err(anyhow!("disk full"))),
            counted.clone(),
            Handler::new("panics", |_, _, _| panic!("boom")),
            counted,
        ];

        let outcomes = run_handlers("loss", &handlers, &Series::new(), Path::new("."));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].error.as_deref(), Some("disk full"));
        assert!(outcomes[1].is_ok());
        assert_eq!(outcomes[2].error.as_deref(), Some("panicked: boom"));
        assert!(outcomes[3].is_ok());
    }

    #[test]
    fn last_handlers_fail_on_empty_series() {
        let outcome = run_handlers("loss", &[echo_last()], &Series::new(), Path::new("."));
        assert_eq!(
            outcome[0].error.as_deref(),
            Some("no data recorded for loss")
        );
    }

    #[test]
    fn save_to_json_writes_whole_series() {
        let tmp = TempDir::new().unwrap();
        let data = series(&[(0, 1.5), (3, 0.5)]);
        save_to_json().call("loss", &data, tmp.path()).unwrap();

        let content = std::fs::read_to_string(tmp.path().join("loss.json")).unwrap();
        assert_eq!(content, r#"{"0":1.5,"3":0.5}"#);
    }

    #[test]
    fn save_to_text_last_writes_last_value() {
        let tmp = TempDir::new().unwrap();
        let data = series(&[(7, 2.0), (2, 9.0)]);
        save_to_text_last().call("acc", &data, tmp.path()).unwrap();

        let content = std::fs::read_to_string(tmp.path().join("acc.txt")).unwrap();
        assert_eq!(content, "2");
    }

    #[test]
    fn builtin_registry_resolves_by_name() {
        let registry = HandlerRegistry::builtin();
        assert_eq!(registry.len(), 10);
        assert_eq!(registry.get("save_to_json").unwrap().name(), "save_to_json");
        assert!(registry.get("save_to_gif").is_none());
    }
}

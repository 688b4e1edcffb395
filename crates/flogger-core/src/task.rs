//! Units of work submitted to a pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::error::{FloggerError, Result};
use crate::handlers::{panic_message, HandlerInvoker, HandlerOutcome};
use crate::models::{Event, Key, Value};
use crate::store::EntryStore;

/// Called with the failure of a unit of work as a whole.
pub type ErrorCallback = Arc<dyn Fn(&FloggerError) + Send + Sync>;

/// A unit of work, closed over its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Append `value` at `key` (or at the entry's counter), then run push handlers.
    Push {
        entry: String,
        value: Value,
        key: Option<Key>,
    },
    /// Run dump handlers on the current data.
    Dump { entry: String },
    /// Run reset handlers on the current data, then clear it.
    Reset { entry: String },
}

impl Task {
    pub fn entry(&self) -> &str {
        match self {
            Task::Push { entry, .. } | Task::Dump { entry } | Task::Reset { entry } => entry,
        }
    }

    pub fn event(&self) -> Event {
        match self {
            Task::Push { .. } => Event::Push,
            Task::Dump { .. } => Event::Dump,
            Task::Reset { .. } => Event::Reset,
        }
    }

    /// Run the task against `store` while holding the entry lock for the whole
    /// unit: mutation, every handler call, and the final clear of a reset.
    ///
    /// Returns `Err` only when the unit itself could not complete; handler
    /// failures are collected in the report.
    pub fn run(self, store: &dyn EntryStore, invoker: &mut dyn HandlerInvoker) -> Result<TaskReport> {
        let event = self.event();
        let (entry, pushed) = match self {
            Task::Push { entry, value, key } => (entry, Some((key, value))),
            Task::Dump { entry } | Task::Reset { entry } => (entry, None),
        };

        let mut lock = store.lock(&entry)?;
        if let Some((key, value)) = pushed {
            let key = key.unwrap_or_else(|| lock.counter());
            lock.append(key, value);
        }

        let handlers = lock.handlers(event);
        let invoked = if handlers.is_empty() {
            Ok(Vec::new())
        } else {
            invoker.invoke(event, &entry, handlers, &lock.snapshot(), &store.path())
        };

        if event == Event::Reset {
            lock.clear();
        }
        drop(lock);

        Ok(TaskReport {
            logger: store.name(),
            entry,
            event,
            outcomes: invoked?,
        })
    }
}

/// Per-handler outcomes of one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub logger: String,
    pub entry: String,
    pub event: Event,
    pub outcomes: Vec<HandlerOutcome>,
}

impl TaskReport {
    pub fn failures(&self) -> impl Iterator<Item = FloggerError> + '_ {
        self.outcomes.iter().filter_map(|outcome| {
            outcome.error.as_ref().map(|cause| FloggerError::Handler {
                logger: self.logger.clone(),
                entry: self.entry.clone(),
                handler: outcome.handler.clone(),
                cause: cause.clone(),
            })
        })
    }

    /// Emit one warning per failed handler.
    pub fn log(&self) {
        for failure in self.failures() {
            if let FloggerError::Handler { handler, .. } = &failure {
                warn!(
                    logger = %self.logger,
                    entry = %self.entry,
                    event = %self.event,
                    handler = %handler,
                    "{failure}"
                );
            }
        }
    }
}

/// Run a task, logging handler failures and routing a failure of the unit as a
/// whole (including a panic outside of any handler) to `on_error`.
pub(crate) fn execute(
    task: Task,
    store: &dyn EntryStore,
    invoker: &mut dyn HandlerInvoker,
    on_error: &ErrorCallback,
) -> Result<()> {
    let result = match panic::catch_unwind(AssertUnwindSafe(|| task.run(store, invoker))) {
        Ok(Ok(report)) => {
            report.log();
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(payload) => Err(FloggerError::Backend(panic_message(payload.as_ref()))),
    };
    if let Err(e) = &result {
        on_error(e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{Handler, HandlerSet, InProcess};
    use crate::models::Series;
    use crate::store::LocalStore;
    use std::path::Path;
    use std::sync::Mutex;

    fn recorder(name: &str, seen: Arc<Mutex<Vec<Series>>>) -> Handler {
        Handler::new(name, move |_, data, _| {
            seen.lock().unwrap().push(data.clone());
            Ok(())
        })
    }

    #[test]
    fn push_uses_counter_as_default_key() {
        let store = LocalStore::new();
        store.declare("loss", HandlerSet::default()).unwrap();
        for v in [0.5, 0.4, 0.3] {
            Task::Push {
                entry: "loss".into(),
                value: Value::from(v),
                key: None,
            }
            .run(&store, &mut InProcess)
            .unwrap();
        }
        let keys: Vec<Key> = store.snapshot("loss").unwrap().keys().copied().collect();
        assert_eq!(keys, vec![0, 1, 2]);
    }

    #[test]
    fn reset_handlers_see_data_before_clear() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let store = LocalStore::new();
        store
            .declare(
                "acc",
                HandlerSet::new(vec![], vec![], vec![recorder("rec", seen.clone())]),
            )
            .unwrap();
        Task::Push {
            entry: "acc".into(),
            value: Value::from(1),
            key: Some(10),
        }
        .run(&store, &mut InProcess)
        .unwrap();

        let report = Task::Reset { entry: "acc".into() }
            .run(&store, &mut InProcess)
            .unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(seen.lock().unwrap()[0].get(&10), Some(&Value::Int(1)));
        assert_eq!(store.counter("acc").unwrap(), 0);
        assert!(store.snapshot("acc").unwrap().is_empty());
    }

    #[test]
    fn failed_handler_is_reported_not_raised() {
        let store = LocalStore::new();
        store.set_name("kikou").unwrap();
        let failing = Handler::new("failing", |_, _, _| anyhow::bail!("nope"));
        store
            .declare("loss", HandlerSet::new(vec![failing], vec![], vec![]))
            .unwrap();

        let report = Task::Push {
            entry: "loss".into(),
            value: Value::from(1.0),
            key: None,
        }
        .run(&store, &mut InProcess)
        .unwrap();

        let failures: Vec<String> = report.failures().map(|e| e.to_string()).collect();
        assert_eq!(
            failures,
            vec!["kikou DataLogger: handler failing of loss failed: nope".to_string()]
        );
        assert_eq!(store.counter("loss").unwrap(), 1);
    }

    struct Broken;

    impl HandlerInvoker for Broken {
        fn invoke(
            &mut self,
            _event: Event,
            _entry: &str,
            _handlers: &[Handler],
            _data: &Series,
            _path: &Path,
        ) -> Result<Vec<HandlerOutcome>> {
            Err(FloggerError::Worker("gone".into()))
        }
    }

    #[test]
    fn reset_still_clears_when_invoker_fails() {
        let store = LocalStore::new();
        let noop = Handler::new("noop", |_, _, _| Ok(()));
        store
            .declare("loss", HandlerSet::new(vec![], vec![], vec![noop]))
            .unwrap();
        store.lock("loss").unwrap().append(0, Value::from(1));

        let errors = Arc::new(Mutex::new(Vec::new()));
        let on_error: ErrorCallback = {
            let errors = errors.clone();
            Arc::new(move |e: &FloggerError| errors.lock().unwrap().push(e.to_string()))
        };
        let result = execute(Task::Reset { entry: "loss".into() }, &store, &mut Broken, &on_error);

        assert!(result.is_err());
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(store.counter("loss").unwrap(), 0);
    }
}

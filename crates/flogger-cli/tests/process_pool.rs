//! Library-level tests of the process pool, using this crate's binary as the
//! worker program.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use flogger::{handlers, DataLogger, Handler, LoggerConfig, PoolKind, Value};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Warnings are emitted on pool threads, so they go through a global subscriber.
fn captured_logs() -> &'static Captured {
    static LOGS: OnceLock<Captured> = OnceLock::new();
    LOGS.get_or_init(|| {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
        logs
    })
}

fn process_logger(tmp: &TempDir, name: &str, errors: &Arc<AtomicUsize>) -> DataLogger {
    let config = LoggerConfig::new(name, tmp.path())
        .with_pool(PoolKind::Process { workers: 1 })
        .with_worker_program(env!("CARGO_BIN_EXE_flogger"))
        .with_poll_interval(Duration::from_millis(5));
    let mut logger = DataLogger::from_config(config).unwrap();
    let errors = errors.clone();
    logger.set_error_callback(move |_| {
        errors.fetch_add(1, Ordering::SeqCst);
    });
    logger
}

#[test]
fn handler_missing_from_worker_is_reported_and_skipped() {
    let logs = captured_logs();
    let tmp = TempDir::new().unwrap();
    let errors = Arc::new(AtomicUsize::new(0));
    let logger = process_logger(&tmp, "unregistered", &errors);

    let local_only = Handler::new("missing_in_worker", |_, _, _| Ok(()));
    logger
        .declare("loss", vec![local_only, handlers::save_to_json_last()], vec![], vec![])
        .unwrap();
    logger.push("loss", 0.5, None).unwrap();
    logger.push("loss", 0.25, None).unwrap();
    assert!(logger.wait_timeout(Duration::from_secs(30), false));

    assert_eq!(logger.entry_length("loss").unwrap(), 2);
    assert_eq!(logger.series("loss").unwrap(), vec![Value::Float(0.5), Value::Float(0.25)]);
    // The handler after the missing one still ran in the worker.
    let saved = std::fs::read_to_string(tmp.path().join("loss.json")).unwrap();
    assert_eq!(saved.trim(), "0.25");
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    let text = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
    assert!(text.contains("handler missing_in_worker of loss failed"), "{text}");
    assert!(text.contains("not registered in this worker"), "{text}");
}

#[test]
fn dump_in_worker_leaves_data_untouched() {
    captured_logs();
    let tmp = TempDir::new().unwrap();
    let errors = Arc::new(AtomicUsize::new(0));
    let logger = process_logger(&tmp, "dumped", &errors);

    logger
        .declare("acc", vec![], vec![handlers::save_to_json()], vec![])
        .unwrap();
    for (i, v) in [0.1, 0.2, 0.3].into_iter().enumerate() {
        logger.push("acc", v, Some(i as u64)).unwrap();
    }
    assert!(logger.wait_timeout(Duration::from_secs(30), false));
    let before = logger.snapshot("acc").unwrap();

    logger.dump();
    assert!(logger.wait_timeout(Duration::from_secs(30), false));

    assert_eq!(logger.snapshot("acc").unwrap(), before);
    assert_eq!(logger.entry_length("acc").unwrap(), 3);
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(tmp.path().join("acc.json")).unwrap()).unwrap();
    assert_eq!(saved, serde_json::json!({ "0": 0.1, "1": 0.2, "2": 0.3 }));
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

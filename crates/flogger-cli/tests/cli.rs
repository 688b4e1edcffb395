//! End-to-end tests for the `flogger` binary.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn flogger() -> Command {
    Command::cargo_bin("flogger").unwrap()
}

/// The single timestamped run directory created under `dir`.
fn run_dir(dir: &Path) -> PathBuf {
    let runs: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(runs.len(), 1, "expected exactly one run directory");
    runs.into_iter().next().unwrap()
}

fn assert_artifacts(run: &Path, steps: usize) {
    let loss: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run.join("loss.json")).unwrap()).unwrap();
    assert_eq!(loss.as_object().unwrap().len(), steps);
    let accuracy = fs::read_to_string(run.join("metrics/accuracy.txt")).unwrap();
    assert_eq!(accuracy.lines().count(), steps);
    assert!(run.join("metrics/accuracy.json").exists());
}

#[test]
fn test_demo_sync_pool() {
    let tmp = TempDir::new().unwrap();
    flogger()
        .args(["demo", "--pool", "sync", "--steps", "20", "--dir"])
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Pool:    sync"))
        .stdout(predicate::str::contains("lr at 10: 0.05"));
    assert_artifacts(&run_dir(tmp.path()), 20);
}

#[test]
fn test_demo_thread_pool() {
    let tmp = TempDir::new().unwrap();
    flogger()
        .args(["demo", "--pool", "thread", "--workers", "4", "--steps", "50", "--dir"])
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("thread(4)"));
    assert_artifacts(&run_dir(tmp.path()), 50);
}

#[test]
fn test_demo_process_pool() {
    let tmp = TempDir::new().unwrap();
    flogger()
        .args(["demo", "--pool", "process", "--workers", "2", "--steps", "15", "--dir"])
        .arg(tmp.path())
        .arg("--worker-program")
        .arg(env!("CARGO_BIN_EXE_flogger"))
        .assert()
        .success()
        .stdout(predicate::str::contains("process(2)"))
        // Forwarded from the worker's stdout.
        .stdout(predicate::str::contains("lr at 10: 0.05"));
    assert_artifacts(&run_dir(tmp.path()), 15);
}

#[test]
fn test_demo_silent_pool_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    flogger()
        .args(["demo", "--pool", "silent", "--steps", "10", "--json", "--dir"])
        .arg(tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pool\": \"silent\""));
    let run = run_dir(tmp.path());
    assert!(!run.join("loss.json").exists());
}

#[test]
fn test_demo_from_yaml_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("flogger.yaml");
    fs::write(&config, "name: from-yaml\npool:\n  kind: thread\n  workers: 2\n").unwrap();
    let out = tmp.path().join("runs");
    flogger()
        .args(["demo", "--steps", "5", "--json", "--config"])
        .arg(&config)
        .arg("--dir")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"logger\": \"from-yaml\""))
        .stdout(predicate::str::contains("thread(2)"));
}

#[test]
fn test_demo_rejects_zero_workers() {
    let tmp = TempDir::new().unwrap();
    flogger()
        .args(["demo", "--pool", "thread", "--workers", "0", "--dir"])
        .arg(tmp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one worker"));
}

#[test]
fn test_worker_subcommand_answers_requests() {
    let request = r#"{"entry":"loss","event":"push","path":".","handlers":["echo_last","nope"],"data":{"0":1.5}}"#;
    flogger()
        .arg("worker")
        .write_stdin(format!("{request}\n"))
        .assert()
        .success()
        .stdout(predicate::str::contains("loss at 0: 1.5"))
        .stdout(predicate::str::contains("\u{1e}flogger:"))
        .stdout(predicate::str::contains("not registered in this worker"));
}

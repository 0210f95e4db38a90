//! Integration tests: CLI smoke tests and daemon lifecycle through the binary.

mod common;

use std::fs;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::Value;

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: irondome [OPTIONS] [PATH]..."),
        "missing help banner; log: {}",
        result.log_path.display()
    );
    for flag in ["--read-limit", "--memory-mode", "--check", "--log-file"] {
        assert!(result.stdout.contains(flag), "help lacks {flag}");
    }
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains(env!("CARGO_PKG_VERSION")),
        "missing version; log: {}",
        result.log_path.display()
    );
}

#[test]
fn check_prints_effective_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_string_lossy().into_owned();
    let result = common::run_cli_case(
        "check_prints_effective_settings",
        &["--check", "--read-limit", "9", "--memory-mode", "hard-cap", &path],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );

    let report: Value = serde_json::from_str(&result.stdout).expect("check output is JSON");
    assert_eq!(report["monitor"]["read_limit"], 9);
    assert_eq!(report["memory"]["mode"], "hard-cap");
    assert_eq!(report["memory"]["limit_mb"], 100);
    let canonical = fs::canonicalize(dir.path()).expect("canonicalize");
    assert_eq!(
        report["watched_paths"][0]["path"],
        canonical.to_string_lossy().as_ref()
    );
    assert_eq!(report["watched_paths"][0]["kind"], "directory");
}

#[test]
fn check_rejects_duplicate_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_string_lossy().into_owned();
    let result = common::run_cli_case("check_rejects_duplicate_paths", &["--check", &path, &path]);
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("IRD-1004"), "stderr: {}", result.stderr);
}

#[test]
fn daemon_rejects_duplicate_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_string_lossy().into_owned();
    let result = common::run_cli_case("daemon_rejects_duplicate_paths", &[&path, &path]);
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());

    let log = fs::read_to_string(&result.daemon_log).expect("daemon log written");
    assert!(log.contains("IRD-1004"), "log: {log}");
    assert!(log.contains("| ERROR |"), "log: {log}");
    assert!(!log.contains("Running read monitor..."), "log: {log}");
}

#[test]
fn check_rejects_canonical_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plain = dir.path().to_string_lossy().into_owned();
    let slashed = format!("{plain}/");
    let result = common::run_cli_case(
        "check_rejects_canonical_duplicates",
        &["--check", &plain, &slashed],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("IRD-1004"), "stderr: {}", result.stderr);
}

#[test]
fn missing_path_is_logged_and_exits_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("nope").to_string_lossy().into_owned();
    let result = common::run_cli_case("missing_path_is_logged_and_exits_one", &[&missing]);
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());

    let log = fs::read_to_string(&result.daemon_log).expect("daemon log written");
    assert!(log.contains("IRD-1005"), "log: {log}");
    assert!(log.contains("| ERROR |"), "log: {log}");
}

#[test]
fn zero_read_limit_is_a_configuration_error() {
    let result = common::run_cli_case(
        "zero_read_limit_is_a_configuration_error",
        &["--check", "--read-limit", "0"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("IRD-1001"), "stderr: {}", result.stderr);
}

#[test]
fn sigterm_stops_daemon_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_string_lossy().into_owned();
    let mut daemon = common::spawn_daemon("sigterm_stops_daemon_cleanly", &[&path]);

    assert!(
        daemon.wait_for_log("Running read monitor...", Duration::from_secs(10)),
        "daemon never started; log: {}",
        daemon.log()
    );
    kill(Pid::from_raw(daemon.pid()), Signal::SIGTERM).expect("send SIGTERM");

    let status = daemon
        .wait_exit(Duration::from_secs(15))
        .expect("daemon exited after SIGTERM");
    assert!(status.success(), "status {status}; log: {}", daemon.log());

    let log = daemon.log();
    assert!(log.contains("Received shutdown signal. Stopping..."), "log: {log}");
    assert!(log.contains("irondome stopped: reason=SIGTERM"), "log: {log}");
}

#[test]
fn burst_of_reads_is_reported_in_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("payroll.csv");
    fs::write(&target, b"id,amount\n").expect("write target");
    let path = dir.path().to_string_lossy().into_owned();
    // Long window: the alert comes from the final evaluation at shutdown.
    let mut daemon = common::spawn_daemon(
        "burst_of_reads_is_reported_in_log",
        &["--window-ms", "600000", "--read-limit", "5", "-v", &path],
    );

    assert!(
        daemon.wait_for_log("Running read monitor...", Duration::from_secs(10)),
        "daemon never started; log: {}",
        daemon.log()
    );
    for _ in 0..7 {
        drop(fs::File::open(&target).expect("open target"));
    }
    assert!(
        daemon.wait_for_log("Read operation detected on", Duration::from_secs(10)),
        "no read observed; log: {}",
        daemon.log()
    );
    // Let the pump catch up with the rest of the burst.
    std::thread::sleep(Duration::from_millis(500));
    kill(Pid::from_raw(daemon.pid()), Signal::SIGINT).expect("send SIGINT");
    let status = daemon
        .wait_exit(Duration::from_secs(15))
        .expect("daemon exited after SIGINT");
    assert!(status.success(), "status {status}; log: {}", daemon.log());

    let log = daemon.log();
    assert!(
        log.contains("Possible disk read abuse detected at"),
        "log: {log}"
    );
    assert!(log.contains("| WARNING |"), "log: {log}");
}

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    /// Transcript of the run, for assertion messages.
    pub log_path: PathBuf,
    /// The daemon's own rotating log.
    pub daemon_log: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_irondome") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "irondome.exe" } else { "irondome" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve irondome binary path for integration test"),
    }
}

fn log_root() -> PathBuf {
    let root = std::env::temp_dir().join("irondome-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");
    root
}

fn base_command(daemon_log: &Path) -> Command {
    let mut command = Command::new(resolve_bin_path());
    command
        .env("IRONDOME_LOG_FILE", daemon_log)
        .env("IRONDOME_LOG_CONSOLE", "true")
        .env_remove("IRONDOME_LOG_LEVEL")
        .env_remove("IRONDOME_DEFAULT_PATHS")
        .env("RUST_BACKTRACE", "1");
    command
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = log_root();
    let stamp = format!("{}-{}", sanitize(case_name), now_millis());
    let log_path = root.join(format!("{stamp}.log"));
    let daemon_log = root.join(format!("{stamp}.irondome.log"));

    let output = base_command(&daemon_log)
        .args(args)
        .output()
        .expect("execute irondome command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    write_transcript(&log_path, case_name, args, &output.status, &stdout, &stderr);

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
        daemon_log,
    }
}

fn write_transcript(
    log_path: &Path,
    case_name: &str,
    args: &[&str],
    status: &ExitStatus,
    stdout: &str,
    stderr: &str,
) {
    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={status}\n"));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(stderr);
    log_content.push('\n');
    fs::write(log_path, log_content).expect("write test log");
}

/// A daemon started in the background.
pub struct DaemonProcess {
    pub child: Child,
    pub daemon_log: PathBuf,
}

impl DaemonProcess {
    pub fn pid(&self) -> i32 {
        i32::try_from(self.child.id()).expect("pid fits in i32")
    }

    /// Current contents of the daemon's log file.
    pub fn log(&self) -> String {
        fs::read_to_string(&self.daemon_log).unwrap_or_default()
    }

    /// Poll the log until `needle` shows up or `timeout` passes.
    pub fn wait_for_log(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.log().contains(needle) {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    /// Wait for exit, killing the process if it outlives `timeout`.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        None
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub fn spawn_daemon(case_name: &str, args: &[&str]) -> DaemonProcess {
    let daemon_log = log_root().join(format!(
        "{}-{}.irondome.log",
        sanitize(case_name),
        now_millis()
    ));
    let child = base_command(&daemon_log)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn irondome daemon");
    DaemonProcess { child, daemon_log }
}

//! Top-level CLI definition and dispatch.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::control;
use serde_json::json;
use thiserror::Error;

use irondome::core::config::{CliOverrides, Config, MemoryGuardMode};
use irondome::core::errors::{ErrorCategory, IronDomeError};
use irondome::core::paths::WatchSet;
use irondome::daemon::loop_main::MonitoringDaemon;
use irondome::daemon::signals::{ShutdownSignal, SignalHandler};
use irondome::logger::dual::{DualLoggerConfig, LOGGER_DAEMON, LoggerHandle, spawn_logger};
use irondome::logger::record::Level;
use irondome::logger::rotating::RotatingFileConfig;
use irondome::platform::pal::detect_platform;

/// How long the binary waits for the logger to write its last records.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// IronDome: flags read bursts on watched paths and guards its own memory.
#[derive(Debug, Parser)]
#[command(
    name = "irondome",
    author,
    version,
    about = "IronDome - host read-abuse monitor",
    long_about = None
)]
pub struct Cli {
    /// Files or directories to monitor. Defaults to monitor.default_paths (/tmp).
    #[arg(value_name = "PATH")]
    paths: Vec<String>,
    /// Override config file path.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Reads per window above which an alert fires.
    #[arg(long, value_name = "N")]
    read_limit: Option<u64>,
    /// Evaluation window in milliseconds.
    #[arg(long, value_name = "MS")]
    window_ms: Option<u64>,
    /// Memory ceiling for the daemon itself, in MB.
    #[arg(long, value_name = "MB")]
    memory_limit_mb: Option<u64>,
    /// Memory guard strategy: soft-poll or hard-cap.
    #[arg(long, value_name = "MODE")]
    memory_mode: Option<MemoryGuardMode>,
    /// Rotating log file path.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Disable colored output.
    #[arg(long)]
    no_color: bool,
    /// Debug logging (every observed read).
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
    /// Validate configuration and paths, print the effective settings, exit.
    #[arg(long)]
    check: bool,
}

/// Errors surfaced by the binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid configuration or arguments.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Already written to the log; only the exit code is left to report.
    #[error("exiting with status {0}")]
    Logged(i32),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) | Self::Json(_) => 2,
            Self::Logged(code) => *code,
        }
    }

    /// Whether `main` still has to print this error.
    pub const fn needs_report(&self) -> bool {
        !matches!(self, Self::Logged(_))
    }
}

impl From<IronDomeError> for CliError {
    fn from(err: IronDomeError) -> Self {
        match err.category() {
            ErrorCategory::Configuration => Self::User(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let log_level = if self.verbose {
            Some(Level::Debug)
        } else if self.quiet {
            Some(Level::Error)
        } else {
            None
        };
        CliOverrides {
            read_limit: self.read_limit,
            window_ms: self.window_ms,
            memory_limit_mb: self.memory_limit_mb,
            memory_mode: self.memory_mode,
            log_file: self.log_file.clone(),
            log_level,
        }
    }

    /// Paths from the command line, or the configured defaults.
    fn watch_args(&self, config: &Config) -> Vec<String> {
        if self.paths.is_empty() {
            config
                .monitor
                .default_paths
                .iter()
                .map(|path| path.to_string_lossy().into_owned())
                .collect()
        } else {
            self.paths.clone()
        }
    }
}

/// Parse configuration, then either validate (`--check`) or monitor.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&cli.overrides())?;

    if cli.check {
        return run_check(cli, &config);
    }
    run_daemon(cli, config)
}

fn run_check(cli: &Cli, config: &Config) -> Result<(), CliError> {
    let watch = WatchSet::resolve(&cli.watch_args(config))?;
    let report = json!({
        "config_file": config.paths.config_file,
        "config_hash": config.stable_hash()?,
        "watched_paths": watch,
        "monitor": config.monitor,
        "memory": config.memory,
        "logging": config.logging,
    });
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &report)?;
    writeln!(stdout)?;
    Ok(())
}

fn run_daemon(cli: &Cli, config: Config) -> Result<(), CliError> {
    let (logger, logger_join) = spawn_logger(DualLoggerConfig {
        file: RotatingFileConfig {
            path: config.logging.file.clone(),
            fallback_path: config.logging.fallback_file.clone(),
            max_bytes: config.logging.max_bytes,
            backup_count: config.logging.backup_count,
        },
        console: config.logging.console,
        color: !cli.no_color,
        min_level: config.logging.level,
        channel_capacity: config.logging.channel_capacity,
    })?;

    let outcome = monitor(cli, config, &logger);

    logger.flush(FINAL_FLUSH_TIMEOUT);
    logger.shutdown();
    let _ = logger_join.join();
    outcome
}

fn monitor(cli: &Cli, config: Config, logger: &LoggerHandle) -> Result<(), CliError> {
    let report = |err: IronDomeError| {
        logger.log(LOGGER_DAEMON, Level::Error, err.to_string());
        CliError::Logged(match err.category() {
            ErrorCategory::Configuration | ErrorCategory::ResourceExhaustion => 1,
            _ => 2,
        })
    };

    let watch = WatchSet::resolve(&cli.watch_args(&config)).map_err(report)?;
    let platform = detect_platform().map_err(report)?;
    let shutdown = ShutdownSignal::new();
    let signals = SignalHandler::install(shutdown.clone(), logger.clone()).map_err(report)?;

    let mut daemon = MonitoringDaemon::new(config, watch, platform, logger.clone(), shutdown);
    let result = daemon.run();
    signals.close();

    let summary = result.map_err(report)?;
    if summary.memory_breached {
        return Err(CliError::Logged(1));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paths_and_options() {
        let cli = Cli::try_parse_from([
            "irondome",
            "--read-limit",
            "10",
            "--window-ms",
            "500",
            "--memory-limit-mb",
            "64",
            "--memory-mode",
            "hard-cap",
            "--log-file",
            "/tmp/irondome-test.log",
            "--no-color",
            "-v",
            "/srv",
            "/home",
        ])
        .unwrap();
        assert_eq!(cli.paths, vec!["/srv".to_string(), "/home".to_string()]);
        let overrides = cli.overrides();
        assert_eq!(overrides.read_limit, Some(10));
        assert_eq!(overrides.window_ms, Some(500));
        assert_eq!(overrides.memory_limit_mb, Some(64));
        assert_eq!(overrides.memory_mode, Some(MemoryGuardMode::HardCap));
        assert_eq!(overrides.log_level, Some(Level::Debug));
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["irondome", "-v", "-q"]).is_err());
    }

    #[test]
    fn rejects_unknown_memory_mode() {
        assert!(Cli::try_parse_from(["irondome", "--memory-mode", "psychic"]).is_err());
    }

    #[test]
    fn quiet_maps_to_error_level() {
        let cli = Cli::try_parse_from(["irondome", "-q"]).unwrap();
        assert_eq!(cli.overrides().log_level, Some(Level::Error));
    }

    #[test]
    fn empty_paths_fall_back_to_config_defaults() {
        let cli = Cli::try_parse_from(["irondome"]).unwrap();
        let config = Config::default();
        assert_eq!(cli.watch_args(&config), vec!["/tmp".to_string()]);
    }

    #[test]
    fn configuration_errors_exit_one() {
        let err: CliError = IronDomeError::DuplicatePath {
            path: "/tmp".to_string(),
        }
        .into();
        assert_eq!(err.exit_code(), 1);
        assert!(err.needs_report());
        assert!(!CliError::Logged(1).needs_report());
    }
}

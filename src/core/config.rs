//! Configuration system: TOML file + env var overrides + CLI overrides + validation.

#![allow(missing_docs)]

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{IronDomeError, Result};
use crate::logger::record::Level;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/irondome/config.toml";

/// Full IronDome configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// Read-rate monitor knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Paths watched when none are given on the command line.
    pub default_paths: Vec<PathBuf>,
    /// Reads per window above which an alert fires (strictly greater).
    pub read_limit: u64,
    /// Evaluation window length in milliseconds.
    pub window_ms: u64,
    /// Capacity of the event-source → aggregator channel.
    pub event_channel_capacity: usize,
}

/// Which strategy the memory guard uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryGuardMode {
    /// Sample RSS on a tick and exit immediately on breach.
    #[default]
    SoftPoll,
    /// Install an `RLIMIT_AS` ceiling and shut down gracefully when an
    /// allocation on a guarded path fails.
    HardCap,
}

impl MemoryGuardMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SoftPoll => "soft-poll",
            Self::HardCap => "hard-cap",
        }
    }
}

impl fmt::Display for MemoryGuardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryGuardMode {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "soft-poll" | "soft" | "poll" => Ok(Self::SoftPoll),
            "hard-cap" | "hard" | "cap" => Ok(Self::HardCap),
            other => Err(format!(
                "unknown memory mode {other:?} (expected soft-poll or hard-cap)"
            )),
        }
    }
}

/// Memory guard settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub mode: MemoryGuardMode,
    /// Ceiling in megabytes (MiB).
    pub limit_mb: u64,
    /// Soft-poll sampling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// How long the soft-poll breach path waits for the logger before exiting.
    pub breach_flush_timeout_ms: u64,
}

/// Log sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Rotating log file.
    pub file: PathBuf,
    /// Used when `file` cannot be opened.
    pub fallback_file: Option<PathBuf>,
    /// Rotate when the file would grow past this many bytes.
    pub max_bytes: u64,
    /// Number of rotated backups kept (`irondome.log.1` … `.N`).
    pub backup_count: u32,
    /// Mirror every record to stderr.
    pub console: bool,
    /// Minimum level written to either sink.
    pub level: Level,
    /// Capacity of the logger channel.
    pub channel_capacity: usize,
}

/// Filesystem paths used by irondome itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_paths: vec![PathBuf::from("/tmp")],
            read_limit: 5,
            window_ms: 1_000,
            event_channel_capacity: 8_192,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: MemoryGuardMode::SoftPoll,
            limit_mb: 100,
            poll_interval_ms: 2_000,
            breach_flush_timeout_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/var/log/irondome/irondome.log"),
            fallback_file: None,
            max_bytes: 5_000_000,
            backup_count: 3,
            console: true,
            level: Level::Info,
            channel_capacity: 1_024,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl MemoryConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn breach_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.breach_flush_timeout_ms)
    }
}

/// Command-line overrides layered on top of file + env configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub read_limit: Option<u64>,
    pub window_ms: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub memory_mode: Option<MemoryGuardMode>,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<Level>,
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf)
                .map_err(|source| IronDomeError::io(&path_buf, source))?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(IronDomeError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply command-line overrides and re-validate.
    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) -> Result<()> {
        if let Some(limit) = overrides.read_limit {
            self.monitor.read_limit = limit;
        }
        if let Some(window) = overrides.window_ms {
            self.monitor.window_ms = window;
        }
        if let Some(limit) = overrides.memory_limit_mb {
            self.memory.limit_mb = limit;
        }
        if let Some(mode) = overrides.memory_mode {
            self.memory.mode = mode;
        }
        if let Some(file) = &overrides.log_file {
            self.logging.file.clone_from(file);
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        self.validate()
    }

    /// Deterministic hash of the effective config for the startup log line.
    ///
    /// FNV-1a over the JSON form so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        set_env_parsed(&mut lookup, "IRONDOME_READ_LIMIT", &mut self.monitor.read_limit)?;
        set_env_parsed(&mut lookup, "IRONDOME_WINDOW_MS", &mut self.monitor.window_ms)?;
        set_env_parsed(
            &mut lookup,
            "IRONDOME_EVENT_CHANNEL_CAPACITY",
            &mut self.monitor.event_channel_capacity,
        )?;
        if let Some(raw) = lookup("IRONDOME_DEFAULT_PATHS") {
            self.monitor.default_paths = raw
                .split(':')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        set_env_parsed(&mut lookup, "IRONDOME_MEMORY_MODE", &mut self.memory.mode)?;
        set_env_parsed(&mut lookup, "IRONDOME_MEMORY_LIMIT_MB", &mut self.memory.limit_mb)?;
        set_env_parsed(
            &mut lookup,
            "IRONDOME_MEMORY_POLL_INTERVAL_MS",
            &mut self.memory.poll_interval_ms,
        )?;

        if let Some(raw) = lookup("IRONDOME_LOG_FILE") {
            self.logging.file = PathBuf::from(raw.trim());
        }
        set_env_parsed(&mut lookup, "IRONDOME_LOG_LEVEL", &mut self.logging.level)?;
        set_env_parsed(&mut lookup, "IRONDOME_LOG_MAX_BYTES", &mut self.logging.max_bytes)?;
        set_env_parsed(&mut lookup, "IRONDOME_LOG_BACKUPS", &mut self.logging.backup_count)?;
        set_env_parsed(&mut lookup, "IRONDOME_LOG_CONSOLE", &mut self.logging.console)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("monitor.read_limit", self.monitor.read_limit),
            ("monitor.window_ms", self.monitor.window_ms),
            ("memory.limit_mb", self.memory.limit_mb),
            ("memory.poll_interval_ms", self.memory.poll_interval_ms),
            ("logging.max_bytes", self.logging.max_bytes),
        ] {
            if value == 0 {
                return Err(IronDomeError::InvalidConfig {
                    details: format!("{name} must be a positive integer"),
                });
            }
        }

        if self.monitor.event_channel_capacity == 0 || self.logging.channel_capacity == 0 {
            return Err(IronDomeError::InvalidConfig {
                details: "channel capacities must be positive".to_string(),
            });
        }

        if self.logging.backup_count == 0 {
            return Err(IronDomeError::InvalidConfig {
                details: "logging.backup_count must be at least 1".to_string(),
            });
        }

        // Keeps limit_mb * MiB inside u64 and below any real address space.
        if self.memory.limit_mb > (1 << 40) {
            return Err(IronDomeError::InvalidConfig {
                details: format!("memory.limit_mb {} is out of range", self.memory.limit_mb),
            });
        }

        if self.logging.file.as_os_str().is_empty() {
            return Err(IronDomeError::InvalidConfig {
                details: "logging.file must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_env_parsed<F, T>(lookup: &mut F, name: &str, slot: &mut T) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse::<T>()
            .map_err(|error| IronDomeError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

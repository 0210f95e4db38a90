//! IRD-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, IronDomeError>;

/// Top-level error type for IronDome.
#[derive(Debug, Error)]
pub enum IronDomeError {
    #[error("[IRD-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[IRD-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[IRD-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[IRD-1004] duplicate watch path: {path}")]
    DuplicatePath { path: String },

    #[error("[IRD-1005] watch path does not exist: {path}")]
    PathNotFound { path: PathBuf },

    #[error("[IRD-1006] no valid paths to monitor: {details}")]
    NoWatchablePaths { details: String },

    #[error("[IRD-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[IRD-2001] watch failure for {path}: {details}")]
    Watch { path: PathBuf, details: String },

    #[error("[IRD-2002] owner lookup failed for {path}: {details}")]
    OwnerLookup { path: PathBuf, details: String },

    #[error("[IRD-2101] cannot read process memory stats: {details}")]
    MemoryStats { details: String },

    #[error("[IRD-2102] cannot install address-space cap: {details}")]
    MemoryCap { details: String },

    #[error("[IRD-2103] out of memory in {context}: {details}")]
    OutOfMemory {
        context: &'static str,
        details: String,
    },

    #[error("[IRD-2201] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[IRD-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[IRD-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[IRD-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[IRD-3900] runtime failure: {details}")]
    Runtime { details: String },
}

/// How an error propagates through the daemon.
///
/// None of the categories is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Reported once at startup; the process exits non-zero before monitoring.
    Configuration,
    /// Per-event failure; logged at debug level, the pipeline keeps counting.
    Transient,
    /// Memory breach; always ends the process.
    ResourceExhaustion,
    /// A watch failed after startup; that watch is dropped, the rest continue.
    Subscription,
    /// Broken internal plumbing (thread spawn, closed channel, IO).
    Internal,
}

impl IronDomeError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "IRD-1001",
            Self::MissingConfig { .. } => "IRD-1002",
            Self::ConfigParse { .. } => "IRD-1003",
            Self::DuplicatePath { .. } => "IRD-1004",
            Self::PathNotFound { .. } => "IRD-1005",
            Self::NoWatchablePaths { .. } => "IRD-1006",
            Self::UnsupportedPlatform { .. } => "IRD-1101",
            Self::Watch { .. } => "IRD-2001",
            Self::OwnerLookup { .. } => "IRD-2002",
            Self::MemoryStats { .. } => "IRD-2101",
            Self::MemoryCap { .. } => "IRD-2102",
            Self::OutOfMemory { .. } => "IRD-2103",
            Self::Serialization { .. } => "IRD-2201",
            Self::PermissionDenied { .. } => "IRD-3001",
            Self::Io { .. } => "IRD-3002",
            Self::ChannelClosed { .. } => "IRD-3003",
            Self::Runtime { .. } => "IRD-3900",
        }
    }

    /// Propagation category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfig { .. }
            | Self::MissingConfig { .. }
            | Self::ConfigParse { .. }
            | Self::DuplicatePath { .. }
            | Self::PathNotFound { .. }
            | Self::NoWatchablePaths { .. }
            | Self::UnsupportedPlatform { .. }
            | Self::MemoryStats { .. }
            | Self::MemoryCap { .. }
            | Self::PermissionDenied { .. } => ErrorCategory::Configuration,
            Self::OwnerLookup { .. } => ErrorCategory::Transient,
            Self::OutOfMemory { .. } => ErrorCategory::ResourceExhaustion,
            Self::Watch { .. } => ErrorCategory::Subscription,
            Self::Serialization { .. }
            | Self::Io { .. }
            | Self::ChannelClosed { .. }
            | Self::Runtime { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this error must stop the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::Subscription
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for IronDomeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for IronDomeError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<IronDomeError> {
        vec![
            IronDomeError::InvalidConfig {
                details: String::new(),
            },
            IronDomeError::MissingConfig {
                path: PathBuf::new(),
            },
            IronDomeError::ConfigParse {
                context: "",
                details: String::new(),
            },
            IronDomeError::DuplicatePath {
                path: String::new(),
            },
            IronDomeError::PathNotFound {
                path: PathBuf::new(),
            },
            IronDomeError::NoWatchablePaths {
                details: String::new(),
            },
            IronDomeError::UnsupportedPlatform {
                details: String::new(),
            },
            IronDomeError::Watch {
                path: PathBuf::new(),
                details: String::new(),
            },
            IronDomeError::OwnerLookup {
                path: PathBuf::new(),
                details: String::new(),
            },
            IronDomeError::MemoryStats {
                details: String::new(),
            },
            IronDomeError::MemoryCap {
                details: String::new(),
            },
            IronDomeError::OutOfMemory {
                context: "",
                details: String::new(),
            },
            IronDomeError::Serialization {
                context: "",
                details: String::new(),
            },
            IronDomeError::PermissionDenied {
                path: PathBuf::new(),
            },
            IronDomeError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            IronDomeError::ChannelClosed { component: "" },
            IronDomeError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(IronDomeError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_display_starts_with_its_code() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(
                msg.starts_with(&format!("[{}]", err.code())),
                "display should lead with code {}: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn startup_errors_are_configuration_category() {
        assert_eq!(
            IronDomeError::DuplicatePath {
                path: "/tmp".to_string()
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            IronDomeError::MemoryCap {
                details: String::new()
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            IronDomeError::MemoryStats {
                details: String::new()
            }
            .category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn only_transient_and_subscription_errors_are_survivable() {
        for err in all_variants() {
            let survivable = matches!(
                err.category(),
                ErrorCategory::Transient | ErrorCategory::Subscription
            );
            assert_eq!(err.is_fatal(), !survivable, "{err}");
        }
        assert!(
            !IronDomeError::OwnerLookup {
                path: PathBuf::from("/gone"),
                details: "ENOENT".to_string()
            }
            .is_fatal()
        );
        assert!(
            IronDomeError::OutOfMemory {
                context: "event batch",
                details: String::new()
            }
            .is_fatal()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = IronDomeError::io(
            "/tmp/test.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "IRD-3002");
        assert!(err.to_string().contains("/tmp/test.txt"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: IronDomeError = json_err.into();
        assert_eq!(err.code(), "IRD-2201");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: IronDomeError = toml_err.into();
        assert_eq!(err.code(), "IRD-1003");
    }
}

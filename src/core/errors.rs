//! KWD-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, KwdError>;

/// Top-level error type for Kiosk Watchdog.
///
/// Only the `KWD-1xxx` configuration family is fatal: the supervisor refuses
/// to start with undefined thresholds. Everything else is caught at the tick
/// boundary, logged, and absorbed.
#[derive(Debug, Error)]
pub enum KwdError {
    #[error("[KWD-1001] invalid recovery policy: {details}")]
    InvalidConfig { details: String },

    #[error("[KWD-1002] missing recovery policy file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[KWD-1003] policy parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[KWD-2001] persisted state unreadable at {path}: {details}")]
    StateCorrupt { path: PathBuf, details: String },

    #[error("[KWD-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[KWD-3001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[KWD-3002] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[KWD-3101] failed to launch recovery command {action}: {details}")]
    CommandSpawn { action: &'static str, details: String },

    #[error("[KWD-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl KwdError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "KWD-1001",
            Self::MissingConfig { .. } => "KWD-1002",
            Self::ConfigParse { .. } => "KWD-1003",
            Self::StateCorrupt { .. } => "KWD-2001",
            Self::Serialization { .. } => "KWD-2101",
            Self::Io { .. } => "KWD-3001",
            Self::ChannelClosed { .. } => "KWD-3002",
            Self::CommandSpawn { .. } => "KWD-3101",
            Self::Runtime { .. } => "KWD-3900",
        }
    }

    /// Whether the process must exit. Only malformed configuration qualifies:
    /// running with undefined thresholds risks unbounded recovery actions.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::MissingConfig { .. } | Self::ConfigParse { .. }
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

impl From<serde_json::Error> for KwdError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for KwdError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

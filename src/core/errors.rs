//! MP-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, MpError>;

/// Top-level error type for mailpulse.
#[derive(Debug, Error)]
pub enum MpError {
    #[error("[MP-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[MP-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[MP-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[MP-2001] invalid log pattern {pattern:?}: {details}")]
    Pattern { pattern: String, details: String },

    #[error("[MP-2002] unknown window {name:?}")]
    UnknownWindow { name: String },

    #[error("[MP-2003] unknown endpoint {name:?}")]
    UnknownEndpoint { name: String },

    #[error("[MP-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[MP-3001] command {program} could not be started: {details}")]
    Spawn { program: String, details: String },

    #[error("[MP-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[MP-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[MP-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl MpError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "MP-1001",
            Self::MissingConfig { .. } => "MP-1002",
            Self::ConfigParse { .. } => "MP-1003",
            Self::Pattern { .. } => "MP-2001",
            Self::UnknownWindow { .. } => "MP-2002",
            Self::UnknownEndpoint { .. } => "MP-2003",
            Self::Serialization { .. } => "MP-2101",
            Self::Spawn { .. } => "MP-3001",
            Self::Io { .. } => "MP-3002",
            Self::ChannelClosed { .. } => "MP-3003",
            Self::Runtime { .. } => "MP-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Spawn { .. } | Self::ChannelClosed { .. } | Self::Runtime { .. }
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

impl From<serde_json::Error> for MpError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for MpError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<regex::Error> for MpError {
    fn from(value: regex::Error) -> Self {
        Self::Pattern {
            pattern: String::new(),
            details: value.to_string(),
        }
    }
}

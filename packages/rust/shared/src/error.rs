//! Error types for SourceHub.
//!
//! Library crates use [`SourceHubError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all SourceHub operations.
#[derive(Debug, thiserror::Error)]
pub enum SourceHubError {
    /// Configuration loading or instance record validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// An operation targeted an instance id that is not in the live table.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// A provider call (`search`, `schedule`, `activate`) failed.
    #[error("provider {instance} failed during {operation}: {message}")]
    Provider {
        instance: String,
        operation: String,
        message: String,
    },

    /// A provider call did not finish within the configured bound.
    #[error("provider {instance} timed out during {operation} after {after:?}")]
    Timeout {
        instance: String,
        operation: String,
        after: Duration,
    },

    /// Spawning or talking to a provider subprocess failed.
    #[error("subprocess error for {instance}: {message}")]
    Subprocess { instance: String, message: String },

    /// A provider subprocess exited.
    #[error("subprocess for {instance} exited ({status})")]
    ProcessExited { instance: String, status: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad parameter, malformed payload, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SourceHubError>;

impl SourceHubError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a provider invocation error.
    pub fn provider(
        instance: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            instance: instance.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a subprocess error.
    pub fn subprocess(instance: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Subprocess {
            instance: instance.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SourceHubError::config("missing conf.bin");
        assert_eq!(err.to_string(), "config error: missing conf.bin");

        let err = SourceHubError::provider("ANi", "search", "connection refused");
        assert_eq!(
            err.to_string(),
            "provider ANi failed during search: connection refused"
        );

        let err = SourceHubError::UnknownInstance("missing-id".into());
        assert!(err.to_string().contains("missing-id"));
    }

    #[test]
    fn timeout_mentions_duration() {
        let err = SourceHubError::Timeout {
            instance: "slow".into(),
            operation: "schedule".into(),
            after: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("5s"));
    }
}

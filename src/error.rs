//! Error types for relayvisor.

use std::time::Duration;

use thiserror::Error;

use crate::relay::FrameError;

/// Main error type for relayvisor.
#[derive(Error, Debug)]
pub enum RelayvisorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("invalid socket DSN (tcp://:6001, unix://rpc.sock)")]
    InvalidSocketDsn,

    #[error("Unsupported DSN scheme '{0}' (expected tcp or unix)")]
    UnsupportedScheme(String),

    #[error("Worker allocation timed out after {0:?}")]
    AllocateTimeout(Duration),

    #[error("Pool is stopped")]
    PoolStopped,

    #[error("Pool has no live workers")]
    PoolUnavailable,

    #[error("Relay error: {0}")]
    Relay(#[from] FrameError),

    #[error("Worker {pid} failed: {message}")]
    Worker {
        pid: u32,
        message: String,
        /// Captured stderr at the time of failure.
        stderr: String,
    },

    #[error("Job error: {0}")]
    Job(String),

    #[error("Failed to spawn worker `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayvisorError {
    /// Build a worker failure without captured output.
    pub fn worker(pid: u32, message: impl Into<String>) -> Self {
        Self::Worker {
            pid,
            message: message.into(),
            stderr: String::new(),
        }
    }

    /// True for errors that signal "server busy" rather than "server broken".
    ///
    /// Callers should surface these as transient, retryable failures.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::AllocateTimeout(_) | Self::PoolStopped | Self::PoolUnavailable
        )
    }

    /// True for errors raised while validating configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidSocketDsn | Self::UnsupportedScheme(_)
        )
    }

    /// Stderr captured from the worker, if this error carries any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Worker { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

/// Result type alias for relayvisor operations.
pub type Result<T, E = RelayvisorError> = std::result::Result<T, E>;

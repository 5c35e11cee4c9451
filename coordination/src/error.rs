//! Coordination error types
//!
//! Per-call generation/validation failures are not errors at this layer; they
//! are classified into [`crate::classifier::ErrorKind`] and recorded. The
//! variants here cover the few conditions a component cannot absorb itself.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors that can occur inside the coordination components
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Lease (re)initialization exhausted its retry budget
    #[error("Session unavailable for endpoint '{endpoint}' after {attempts} attempts: {message}")]
    SessionUnavailable {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    /// A log append would break iteration ordering
    #[error("Out-of-order {log} entry: iteration {iteration} after {last}")]
    OutOfOrder {
        log: &'static str,
        iteration: u32,
        last: u32,
    },

    /// A fitness score that cannot be ordered (NaN or infinite)
    #[error("Invalid fitness score {score} at iteration {iteration}")]
    InvalidScore { score: f64, iteration: u32 },

    /// Invalid build status transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Checkpoint could not be decoded or has an unsupported schema
    #[error("Invalid checkpoint at {path}: {message}")]
    InvalidCheckpoint { path: PathBuf, message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordinationError {
    /// Create a session unavailable error
    pub fn session_unavailable(
        endpoint: impl Into<String>,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::SessionUnavailable {
            endpoint: endpoint.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an invalid checkpoint error
    pub fn invalid_checkpoint(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidCheckpoint {
            path: path.into(),
            message: message.into(),
        }
    }
}
